pub mod api;
pub mod artifact_store;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod job_store;
pub mod models;
pub mod progress;
pub mod retention;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use engine::GenerationEngine;
use job_store::JobStore;
use retention::RetentionScheduler;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: JobStore,
    pub engine: Arc<dyn GenerationEngine>,
    pub retention: RetentionScheduler,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn GenerationEngine>) -> Self {
        let jobs = JobStore::new();
        let retention = RetentionScheduler::new(config.retention, jobs.clone());
        Self {
            config,
            jobs,
            engine,
            retention,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/generate", post(api::generate))
        .route("/status", get(api::missing_job_id))
        .route("/status/", get(api::missing_job_id))
        .route("/status/{job_id}", get(api::get_status))
        .route("/download", get(api::missing_job_id))
        .route("/download/", get(api::missing_job_id))
        .route("/download/{job_id}", get(api::download))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
