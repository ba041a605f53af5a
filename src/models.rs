use std::{fmt, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DIMENSION: u32 = 512;
pub const DEFAULT_STEPS: u32 = 4;
pub const DEFAULT_GUIDANCE: f32 = 3.5;
pub const DEFAULT_INIT_IMAGE_STRENGTH: f32 = 0.4;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 50;
pub const MAX_GUIDANCE: f32 = 10.0;
/// Largest output edge, in pixels, a job may request.
pub const MAX_DIMENSION: u32 = 2048;

/// Floors a pixel dimension to the nearest lower multiple of 64.
pub fn normalize_dimension(value: u32) -> u32 {
    value - (value % 64)
}

pub fn clamp_steps(steps: u32) -> u32 {
    steps.clamp(MIN_STEPS, MAX_STEPS)
}

pub fn clamp_guidance(guidance: f32) -> f32 {
    guidance.clamp(0.0, MAX_GUIDANCE)
}

pub fn clamp_strength(strength: f32) -> f32 {
    strength.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
    #[default]
    Fast,
    HighQuality,
}

impl ModelVariant {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "schnell" | "fast" => Some(Self::Fast),
            "dev" | "high-quality" | "high_quality" => Some(Self::HighQuality),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "schnell",
            Self::HighQuality => "dev",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /generate` as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    pub seed: Option<u64>,
    pub model: Option<String>,
    pub quantize: Option<bool>,
    pub float16: Option<bool>,
    pub lora_path: Option<String>,
    pub init_image_path: Option<String>,
    pub init_image_base64: Option<String>,
    pub init_image_strength: Option<f32>,
}

/// Immutable generation parameters owned by a job.
///
/// Raw values are kept as submitted; the `normalized_*` accessors derive the
/// values the engine actually runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    pub seed: Option<u64>,
    pub model: ModelVariant,
    pub float16: bool,
    pub quantize: bool,
    pub lora_path: Option<PathBuf>,
    pub init_image: Option<PathBuf>,
    pub init_image_strength: Option<f32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: None,
            height: None,
            steps: None,
            guidance: None,
            seed: None,
            model: ModelVariant::default(),
            float16: false,
            quantize: false,
            lora_path: None,
            init_image: None,
            init_image_strength: None,
        }
    }

    /// Builds the domain request from a wire body. `model` must already be
    /// resolved; `init_image` is the effective source path (a decoded temp
    /// file wins over `initImagePath`).
    pub fn from_body(body: GenerateBody, model: ModelVariant, init_image: Option<PathBuf>) -> Self {
        Self {
            prompt: body.prompt,
            width: body.width,
            height: body.height,
            steps: body.steps,
            guidance: body.guidance,
            seed: body.seed,
            model,
            float16: body.float16.unwrap_or(false),
            quantize: body.quantize.unwrap_or(false),
            lora_path: body.lora_path.map(PathBuf::from),
            init_image: init_image.or_else(|| body.init_image_path.map(PathBuf::from)),
            init_image_strength: body.init_image_strength,
        }
    }

    pub fn normalized_width(&self) -> u32 {
        normalize_dimension(self.width.unwrap_or(DEFAULT_DIMENSION))
    }

    pub fn normalized_height(&self) -> u32 {
        normalize_dimension(self.height.unwrap_or(DEFAULT_DIMENSION))
    }

    pub fn normalized_steps(&self) -> u32 {
        clamp_steps(self.steps.unwrap_or(DEFAULT_STEPS))
    }

    pub fn normalized_guidance(&self) -> f32 {
        clamp_guidance(self.guidance.unwrap_or(DEFAULT_GUIDANCE))
    }

    pub fn normalized_strength(&self) -> f32 {
        clamp_strength(self.init_image_strength.unwrap_or(DEFAULT_INIT_IMAGE_STRENGTH))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InProgress { progress: u8 },
    Completed { artifact_path: PathBuf },
    Failed { message: String },
}

impl JobStatus {
    pub fn label(&self) -> StatusLabel {
        match self {
            Self::InProgress { .. } => StatusLabel::InProgress,
            Self::Completed { .. } => StatusLabel::Completed,
            Self::Failed { .. } => StatusLabel::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub request: Arc<GenerationRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn to_response(&self) -> JobStatusResponse {
        let (progress, image_path, error) = match &self.status {
            JobStatus::InProgress { progress } => (*progress, None, None),
            JobStatus::Completed { artifact_path } => {
                (100, Some(artifact_path.display().to_string()), None)
            }
            JobStatus::Failed { message } => (100, None, Some(message.clone())),
        };

        JobStatusResponse {
            status: self.status.label(),
            progress,
            image_path,
            error,
            prompt: self.request.prompt.clone(),
            width: self.request.normalized_width(),
            height: self.request.normalized_height(),
            steps: self.request.normalized_steps(),
            guidance: self.request.normalized_guidance(),
            seed: self.request.seed,
            model: Some(self.request.model.to_string()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAcceptedResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: StatusLabel,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
