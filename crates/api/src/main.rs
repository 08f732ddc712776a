use std::sync::Arc;

use anyhow::Context;

use forgebatch_api::app::{build_app, services};
use forgebatch_catalog::Product;
use forgebatch_infra::catalog::InMemoryProductCatalog;
use forgebatch_infra::BatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forgebatch_observability::init();

    let config = BatchConfig::from_env().context("invalid FORGEBATCH_* configuration")?;

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let catalog = Arc::new(InMemoryProductCatalog::new());
    if let Ok(path) = std::env::var("FORGEBATCH_CATALOG_SEED") {
        seed_catalog(&catalog, &path)?;
    }

    let services = Arc::new(services::build_services(&config, catalog).await?);
    let workers = services.spawn_workers(&config);
    let app = build_app(jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shutting down workers");
    workers.shutdown().await;
    Ok(())
}

/// Load a JSON array of products into the in-memory catalog.
fn seed_catalog(catalog: &InMemoryProductCatalog, path: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let products: Vec<Product> = serde_json::from_str(&raw).with_context(|| format!("invalid catalog seed {path}"))?;
    let count = products.len();
    for product in products {
        catalog.insert(product)?;
    }
    tracing::info!(count, "catalog seeded");
    Ok(())
}
