use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classification recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable (I/O, source unavailable, ...)
    Transient,
    /// Bad input or schema mismatch; retrying cannot help
    Permanent,
    /// The worker died mid-run and the job was redelivered
    WorkerCrash,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::WorkerCrash => "worker_crash",
        }
    }
}

/// Structured error attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobError {
    pub kind: FailureKind,
    /// Stable machine-readable code, e.g. `retries_exhausted`.
    pub code: String,
    pub message: String,
}

impl BatchJobError {
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, code, message)
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, code, message)
    }

    pub fn worker_crash(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerCrash, "worker_crash", message)
    }
}

impl fmt::Display for BatchJobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind.as_str(), self.message)
    }
}
