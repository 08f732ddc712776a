use serde::{Deserialize, Serialize};

/// Output of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobResult {
    /// Storage key of the produced artifact.
    pub file_key: String,
    /// Artifact size in bytes.
    pub file_size: u64,
    /// Number of records (rows) written.
    pub count: u64,
}
