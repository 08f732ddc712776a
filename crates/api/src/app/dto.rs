//! Request/response DTOs for the batch job endpoints.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use forgebatch_batch::{BatchJob, BatchJobStatus};
use forgebatch_core::UserId;
use forgebatch_infra::jobs::JobQuery;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;

/// `POST /admin/batch-jobs` body.
///
/// For `product-export`, `context.shape` fixes the option and image column
/// counts (3 each unless set). Any exported product with more options or
/// images than that fails the job with `schema_mismatch`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateBatchJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub context: JsonValue,
}

/// `GET /admin/batch-jobs` query string. `status` is comma-separated.
#[derive(Debug, Default, Deserialize)]
pub struct ListBatchJobsQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListBatchJobsQuery {
    /// Jobs of `created_by` matching these parameters.
    pub fn to_job_query(&self, created_by: UserId) -> Result<JobQuery, String> {
        let status = match self.status.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                raw.split(',')
                    .map(|s| BatchJobStatus::from_str(s.trim()).map_err(|_| format!("unknown status '{}'", s.trim())))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };

        Ok(JobQuery {
            created_by: Some(created_by),
            job_type: self.job_type.clone(),
            status,
            limit: self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct BatchJobResponse {
    pub batch_job: BatchJob,
}

#[derive(Debug, Serialize)]
pub struct BatchJobListResponse {
    pub batch_jobs: Vec<BatchJob>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}
