use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::TempSourceImage,
    codec::decode_base64_image,
    dispatcher,
    models::{
        GenerateAcceptedResponse, GenerateBody, GenerationRequest, JobStatus, ModelVariant,
    },
    AppState,
};

/// Errors raised at the HTTP boundary. None of them touch the job store.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request body: {message}")]
    InvalidBody { status: StatusCode, message: String },
    #[error("Job id is missing from the request path.")]
    MissingJobId,
    #[error("Unknown model `{0}`. Supported: schnell, dev.")]
    UnknownModel(String),
    #[error("initImageBase64 is not a valid base64 image: {0}")]
    InvalidImagePayload(String),
    #[error("Generation job not found.")]
    JobNotFound,
    #[error("Generated image is not ready for download.")]
    ArtifactNotReady,
    #[error("Generated image no longer exists.")]
    ArtifactMissing,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody { status, .. } => *status,
            Self::MissingJobId | Self::UnknownModel(_) | Self::InvalidImagePayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::JobNotFound | Self::ArtifactNotReady | Self::ArtifactMissing => {
                StatusCode::NOT_FOUND
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidBody { .. } => "INVALID_REQUEST_BODY",
            Self::MissingJobId => "MISSING_JOB_ID",
            Self::UnknownModel(_) => "UNKNOWN_MODEL",
            Self::InvalidImagePayload(_) => "INVALID_IMAGE_PAYLOAD",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::ArtifactNotReady => "ARTIFACT_NOT_READY",
            Self::ArtifactMissing => "ARTIFACT_MISSING",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}

fn require_job_id(raw: &str) -> Result<&str, ApiError> {
    let job_id = raw.trim();
    if job_id.is_empty() {
        return Err(ApiError::MissingJobId);
    }
    Ok(job_id)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = payload?;
    let model = match body.model.as_deref() {
        Some(name) => {
            ModelVariant::parse(name).ok_or_else(|| ApiError::UnknownModel(name.to_string()))?
        }
        None => ModelVariant::default(),
    };

    let source_bytes = body
        .init_image_base64
        .as_deref()
        .map(decode_base64_image)
        .transpose()
        .map_err(|err| ApiError::InvalidImagePayload(err.to_string()))?;

    let job_id = Uuid::new_v4().to_string();

    let temp_source = match source_bytes {
        Some(bytes) => Some(
            TempSourceImage::write(&state.config.image_dir, &job_id, &bytes)
                .await
                .map_err(|err| ApiError::Internal(format!("{err:#}")))?,
        ),
        None => None,
    };

    let init_image = temp_source.as_ref().map(|temp| temp.path().to_path_buf());
    let request = GenerationRequest::from_body(body, model, init_image);
    dispatcher::submit(&state, job_id.clone(), request, temp_source).await;

    Ok((StatusCode::ACCEPTED, Json(GenerateAcceptedResponse { job_id })))
}

pub async fn missing_job_id() -> ApiError {
    ApiError::MissingJobId
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = require_job_id(&job_id)?;
    let job = state.jobs.get(job_id).await.ok_or(ApiError::JobNotFound)?;
    Ok(Json(job.to_response()))
}

pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let job_id = require_job_id(&job_id)?;
    let job = state.jobs.get(job_id).await.ok_or(ApiError::JobNotFound)?;
    let JobStatus::Completed { artifact_path } = job.status else {
        return Err(ApiError::ArtifactNotReady);
    };

    let bytes = match fs::read(&artifact_path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(job_id = %job_id, "Artifact missing on disk");
            return Err(ApiError::ArtifactMissing);
        }
        Err(err) => {
            return Err(ApiError::Internal(format!(
                "Failed to read artifact: {err}"
            )));
        }
    };

    info!(job_id = %job_id, size_bytes = bytes.len(), "Delivering artifact");
    state.retention.on_delivered(job_id, &artifact_path).await;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{job_id}.png\""),
        )
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(format!("Failed to build download response: {err}")))
}
