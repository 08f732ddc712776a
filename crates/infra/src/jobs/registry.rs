//! Job type → processor dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use forgebatch_batch::{BatchJob, BatchJobContext, BatchJobResult};
use forgebatch_core::DomainError;

use super::progress::JobProgress;

/// Failure reported by a processor run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// Retrying may succeed (I/O, source unavailable).
    #[error("transient failure ({code}): {message}")]
    Transient { code: String, message: String },

    /// Retrying cannot help (bad data, schema mismatch).
    #[error("permanent failure ({code}): {message}")]
    Permanent { code: String, message: String },

    /// The processor observed the cancellation flag and stopped.
    #[error("processing canceled")]
    Canceled,
}

impl ProcessorError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Executes one job type.
#[async_trait]
pub trait BatchJobProcessor: Send + Sync {
    fn job_type(&self) -> &'static str;

    /// Parse and validate a raw context for this job type.
    fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError>;

    /// Run one attempt. Must not mutate the job; progress goes through
    /// `progress`.
    async fn run(&self, job: &BatchJob, progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError>;

    /// Remove the artifact of a result that could not be recorded.
    async fn discard(&self, _result: &BatchJobResult) -> Result<(), ProcessorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("a processor for job type '{0}' is already registered")]
    Duplicate(String),
}

/// Fixed set of processors, built at startup.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: BTreeMap<&'static str, Arc<dyn BatchJobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn BatchJobProcessor>) -> Result<(), RegistryError> {
        let job_type = processor.job_type();
        if self.processors.contains_key(job_type) {
            return Err(RegistryError::Duplicate(job_type.to_string()));
        }
        self.processors.insert(job_type, processor);
        Ok(())
    }

    pub fn with(mut self, processor: Arc<dyn BatchJobProcessor>) -> Result<Self, RegistryError> {
        self.register(processor)?;
        Ok(self)
    }

    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn BatchJobProcessor>, RegistryError> {
        self.processors
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownJobType(job_type.to_string()))
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        self.processors.keys().copied().collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_batch::PRODUCT_EXPORT;

    struct Noop;

    #[async_trait]
    impl BatchJobProcessor for Noop {
        fn job_type(&self) -> &'static str {
            PRODUCT_EXPORT
        }

        fn validate(&self, context: JsonValue) -> Result<BatchJobContext, DomainError> {
            BatchJobContext::from_parts(PRODUCT_EXPORT, context)
        }

        async fn run(&self, _job: &BatchJob, _progress: &dyn JobProgress) -> Result<BatchJobResult, ProcessorError> {
            Err(ProcessorError::permanent("noop", "does nothing"))
        }
    }

    #[test]
    fn resolves_registered_types_only() {
        let registry = ProcessorRegistry::new().with(Arc::new(Noop)).unwrap();
        assert!(registry.resolve(PRODUCT_EXPORT).is_ok());
        assert_eq!(
            registry.resolve("order-import").err(),
            Some(RegistryError::UnknownJobType("order-import".to_string()))
        );
        assert_eq!(registry.job_types(), vec![PRODUCT_EXPORT]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Noop)),
            Err(RegistryError::Duplicate(_))
        ));
    }
}
