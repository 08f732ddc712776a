use axum::{routing::get, Router};

pub mod batch_jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/admin/batch-jobs", batch_jobs::router())
}
