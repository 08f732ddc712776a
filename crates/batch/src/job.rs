//! The `BatchJob` record and its status machine.
//!
//! ```text
//! created ──► processing ──► completed
//!    │            │  ▲  └──► failed
//!    │            └──┘ (retry)
//!    └──────────► canceled ◄── processing (cooperative)
//! ```
//!
//! Completed, failed and canceled are sticky: every transition out of them is
//! rejected with `DomainError::InvalidTransition`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchJobId, DomainError, DomainResult, UserId};

use crate::context::BatchJobContext;
use crate::error::BatchJobError;
use crate::result::BatchJobResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Created,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl BatchJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchJobStatus::Completed | BatchJobStatus::Failed | BatchJobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchJobStatus::Created => "created",
            BatchJobStatus::Processing => "processing",
            BatchJobStatus::Completed => "completed",
            BatchJobStatus::Failed => "failed",
            BatchJobStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for BatchJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BatchJobStatus::Created),
            "processing" => Ok(BatchJobStatus::Processing),
            "completed" => Ok(BatchJobStatus::Completed),
            "failed" => Ok(BatchJobStatus::Failed),
            "canceled" => Ok(BatchJobStatus::Canceled),
            other => Err(DomainError::validation(format!("unknown batch job status '{other}'"))),
        }
    }
}

/// Advisory progress, reset at the start of every attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobProgress {
    pub advancement_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

/// What a cancel request did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; it is now canceled.
    Canceled,
    /// The job is running; the processor will observe the flag.
    Requested,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchJob {
    pub id: BatchJobId,
    /// Serialized as `type` + `context`.
    #[serde(flatten)]
    pub context: BatchJobContext,
    pub status: BatchJobStatus,
    pub progress: BatchJobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BatchJobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchJobError>,
    /// Error of the most recent attempt while a retry is pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<BatchJobError>,
    pub created_by: UserId,
    pub attempts: u32,
    pub cancel_requested: bool,
    pub retry_scheduled: bool,
    /// Optimistic concurrency version; bumped by the store on every write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// A fresh job in `created`.
    pub fn new(context: BatchJobContext, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: BatchJobId::new(),
            context,
            status: BatchJobStatus::Created,
            progress: BatchJobProgress::default(),
            result: None,
            error: None,
            last_error: None,
            created_by,
            attempts: 0,
            cancel_requested: false,
            retry_scheduled: false,
            version: 0,
            created_at: now,
            updated_at: now,
            processing_at: None,
            completed_at: None,
            failed_at: None,
            canceled_at: None,
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.context.job_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A delivery of a job that is already processing with no retry queued
    /// means the previous worker never finished.
    pub fn is_crash_redelivery(&self) -> bool {
        self.status == BatchJobStatus::Processing && !self.retry_scheduled
    }

    /// Begin an attempt. Allowed from `created` and from `processing`
    /// (retry or redelivery); progress restarts from zero.
    pub fn start_processing(&mut self) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Created, BatchJobStatus::Processing], "start processing")?;
        let now = Utc::now();
        self.status = BatchJobStatus::Processing;
        self.attempts += 1;
        self.retry_scheduled = false;
        self.progress = BatchJobProgress::default();
        self.processing_at.get_or_insert(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn record_progress(&mut self, advancement_count: u64, total_count: Option<u64>) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Processing], "record progress")?;
        self.progress = BatchJobProgress {
            advancement_count,
            total_count,
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Stay in `processing` with a retry queued.
    pub fn schedule_retry(&mut self, error: BatchJobError) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Processing], "schedule retry")?;
        self.retry_scheduled = true;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self, result: BatchJobResult) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Processing], "complete")?;
        let now = Utc::now();
        self.status = BatchJobStatus::Completed;
        self.result = Some(result);
        self.last_error = None;
        self.retry_scheduled = false;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: BatchJobError) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Created, BatchJobStatus::Processing], "fail")?;
        let now = Utc::now();
        self.status = BatchJobStatus::Failed;
        self.error = Some(error);
        self.last_error = None;
        self.retry_scheduled = false;
        self.failed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Best-effort cancellation; never fails.
    pub fn request_cancel(&mut self) -> CancelOutcome {
        match self.status {
            BatchJobStatus::Created => {
                self.cancel_requested = true;
                self.set_canceled();
                CancelOutcome::Canceled
            }
            BatchJobStatus::Processing => {
                self.cancel_requested = true;
                self.updated_at = Utc::now();
                CancelOutcome::Requested
            }
            _ => CancelOutcome::AlreadyTerminal,
        }
    }

    /// Finalize a cooperative cancellation.
    pub fn mark_canceled(&mut self) -> DomainResult<()> {
        self.ensure_in(&[BatchJobStatus::Created, BatchJobStatus::Processing], "cancel")?;
        self.set_canceled();
        Ok(())
    }

    /// Verify the result/error exclusivity rules for the current status.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let ok = match self.status {
            BatchJobStatus::Completed => self.result.is_some() && self.error.is_none(),
            BatchJobStatus::Failed => self.error.is_some() && self.result.is_none(),
            _ => self.result.is_none() && self.error.is_none(),
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "batch job {} in status {} has inconsistent result/error",
                self.id,
                self.status.as_str()
            )))
        }
    }

    fn set_canceled(&mut self) {
        let now = Utc::now();
        self.status = BatchJobStatus::Canceled;
        self.retry_scheduled = false;
        self.canceled_at = Some(now);
        self.updated_at = now;
    }

    fn ensure_in(&self, allowed: &[BatchJobStatus], action: &str) -> DomainResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot {action} batch job {} in status {}",
                self.id,
                self.status.as_str()
            )))
        }
    }
}
