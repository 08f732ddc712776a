//! `forgebatch-infra`: execution and IO for batch jobs.
//!
//! - `catalog`: paginated product source (`ProductSource`)
//! - `storage`: keyed artifact storage with commit/abort sinks
//! - `export`: column schema, row serializer and the streaming export writer
//! - `jobs`: job store, queue, processor registry, orchestrator and workers
//! - `config`: environment-driven configuration

pub mod catalog;
pub mod config;
pub mod export;
pub mod jobs;
pub mod storage;

pub use config::{BatchConfig, ConfigError};
