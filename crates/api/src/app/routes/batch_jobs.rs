use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio_util::io::ReaderStream;
use tracing::warn;

use forgebatch_auth::permissions::batch_jobs;
use forgebatch_batch::{BatchJob, BatchJobStatus};
use forgebatch_core::BatchJobId;
use forgebatch_infra::storage::StorageError;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::authz;
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_batch_job).get(list_batch_jobs))
        .route("/:id", get(get_batch_job))
        .route("/:id/cancel", post(cancel_batch_job))
        .route("/:id/download", get(download_batch_job))
}

pub async fn create_batch_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateBatchJobRequest>,
) -> axum::response::Response {
    if let Err(e) = authz::require(&principal, &batch_jobs::CREATE) {
        return errors::authz_error_to_response(e);
    }

    match services
        .orchestrator
        .submit(&body.job_type, body.context, principal.user_id())
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(dto::BatchJobResponse { batch_job: job })).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_batch_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(params): Query<dto::ListBatchJobsQuery>,
) -> axum::response::Response {
    if let Err(e) = authz::require(&principal, &batch_jobs::READ) {
        return errors::authz_error_to_response(e);
    }

    let query = match params.to_job_query(principal.user_id()) {
        Ok(q) => q,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", msg),
    };

    match services.orchestrator.list(&query).await {
        Ok(jobs) => Json(dto::BatchJobListResponse {
            count: jobs.len(),
            batch_jobs: jobs,
            limit: query.limit,
            offset: query.offset,
        })
        .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_batch_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match load_owned(&services, &principal, &id).await {
        Ok(job) => Json(dto::BatchJobResponse { batch_job: job }).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cancel_batch_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(e) = authz::require(&principal, &batch_jobs::CANCEL) {
        return errors::authz_error_to_response(e);
    }
    let job = match load_owned(&services, &principal, &id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    match services.orchestrator.cancel(job.id).await {
        Ok(job) => Json(dto::BatchJobResponse { batch_job: job }).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Stream the export file of a completed job.
pub async fn download_batch_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job = match load_owned(&services, &principal, &id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    let result = match (&job.status, &job.result) {
        (BatchJobStatus::Completed, Some(result)) => result,
        _ => {
            return errors::json_error(
                StatusCode::CONFLICT,
                "not_completed",
                format!("batch job is {}", job.status.as_str()),
            );
        }
    };

    let path = match services.storage.resolve(&result.file_key).await {
        Ok(p) => p,
        Err(StorageError::NotFound(key)) => {
            warn!(job_id = %job.id, file_key = %key, "export file missing for completed job");
            return errors::json_error(StatusCode::NOT_FOUND, "file_not_found", "export file no longer exists");
        }
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string()),
    };

    let filename = result.file_key.rsplit('/').next().unwrap_or("export.csv");
    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        (header::CONTENT_LENGTH, result.file_size.to_string()),
    ];

    (StatusCode::OK, headers, Body::from_stream(ReaderStream::new(file))).into_response()
}

/// Parse `id`, authorize the read and load the job.
async fn load_owned(
    services: &AppServices,
    principal: &PrincipalContext,
    id: &str,
) -> Result<BatchJob, axum::response::Response> {
    authz::require(principal, &batch_jobs::READ).map_err(errors::authz_error_to_response)?;

    let id: BatchJobId = id
        .parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid batch job id"))?;

    let job = services
        .orchestrator
        .get_status(id)
        .await
        .map_err(errors::orchestrator_error_to_response)?;

    authz::ensure_owner(principal, job.created_by).map_err(errors::authz_error_to_response)?;
    Ok(job)
}
