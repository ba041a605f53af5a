use std::sync::Arc;

use anyhow::Result;
use flux_job_api::{
    artifact_store, build_router, config::Config, engine::ProceduralEngine, AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flux_job_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    artifact_store::ensure_image_dir(&config.image_dir).await?;

    info!(
        image_dir = %config.image_dir.display(),
        retention = ?config.retention,
        "Artifact store ready"
    );

    let engine = Arc::new(ProceduralEngine::new(config.step_delay));
    let bind_addr = config.bind_addr;
    let app = build_router(AppState::new(config, engine));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("flux-job-api listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
