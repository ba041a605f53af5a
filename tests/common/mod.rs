#![allow(dead_code)]

use std::{
    path::Path,
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, Response, StatusCode},
    Router,
};
use flux_job_api::{
    build_router,
    codec::{LatentImage, Tensor},
    config::Config,
    engine::{GenerationConfig, GenerationEngine, ProceduralEngine, StepSequence},
    retention::RetentionPolicy,
    AppState,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Wraps the procedural engine so each denoising step waits for a permit.
/// Dropping the sender releases every remaining step.
pub struct GatedEngine {
    inner: ProceduralEngine,
    permits: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl GatedEngine {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                inner: ProceduralEngine::default(),
                permits: Arc::new(Mutex::new(rx)),
            },
            tx,
        )
    }

    fn gate(&self, sequence: StepSequence) -> StepSequence {
        let total = sequence.total();
        let permits = self.permits.clone();
        StepSequence::new(
            total,
            sequence.map(move |step| {
                let _ = permits.lock().unwrap().recv();
                step
            }),
        )
    }
}

impl GenerationEngine for GatedEngine {
    fn text_to_image(&self, config: &GenerationConfig) -> Result<StepSequence> {
        Ok(self.gate(self.inner.text_to_image(config)?))
    }

    fn image_to_image(
        &self,
        config: &GenerationConfig,
        source: Tensor,
        strength: f32,
    ) -> Result<StepSequence> {
        Ok(self.gate(self.inner.image_to_image(config, source, strength)?))
    }

    fn decode(&self, latents: LatentImage) -> Result<Tensor> {
        self.inner.decode(latents)
    }
}

pub fn test_state(
    public_dir: &Path,
    policy: RetentionPolicy,
    engine: Arc<dyn GenerationEngine>,
) -> AppState {
    let mut config = Config::for_public_dir(public_dir);
    config.retention = policy;
    std::fs::create_dir_all(&config.image_dir).unwrap();
    AppState::new(config, engine)
}

pub fn app(state: &AppState) -> Router {
    build_router(state.clone())
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_raw(app: &Router, uri: &str, content_type: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", content_type)
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn submit(app: &Router, body: Value) -> String {
    let response = post_json(app, "/generate", body).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["jobId"].as_str().unwrap().to_string()
}

/// Polls `/status/{id}` until `predicate` holds, panicking after five seconds.
pub async fn wait_for_status<F>(app: &Router, job_id: &str, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..500 {
        let response = get(app, &format!("/status/{job_id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        if predicate(&json) {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached the expected status");
}

/// Polls for a while and asserts the reported progress stays at `expected`.
pub async fn assert_progress_holds(app: &Router, job_id: &str, expected: u64) {
    for _ in 0..20 {
        let json = body_json(get(app, &format!("/status/{job_id}")).await).await;
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["progress"], expected);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_completion(app: &Router, job_id: &str) -> Value {
    wait_for_status(app, job_id, |json| json["status"] != "in_progress").await
}
