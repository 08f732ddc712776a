use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use forgebatch_auth::AuthzError;
use forgebatch_core::DomainError;
use forgebatch_infra::jobs::OrchestratorError;

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::UnknownJobType(t) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_job_type",
            format!("unknown batch job type: {t}"),
        ),
        OrchestratorError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_context", msg),
        OrchestratorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("batch job {id} not found"))
        }
        OrchestratorError::Contention(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("batch job {id} is being updated concurrently; retry"),
        ),
        OrchestratorError::Domain(e) => domain_error_to_response(e),
        OrchestratorError::Store(e) => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        OrchestratorError::Queue(e) => {
            tracing::error!(error = %e, "job queue error");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
    }
}

fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvalidTransition(msg) => json_error(StatusCode::CONFLICT, "invalid_transition", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
    }
}

pub fn authz_error_to_response(err: AuthzError) -> axum::response::Response {
    json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
