use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{error, info};

use crate::{
    artifact_store::{artifact_path, TempSourceImage},
    codec::{load_source_tensor, unpack_latents, RasterImage},
    engine::{check_output_size, GenerationConfig, GenerationEngine},
    models::{GenerationRequest, JobStatus},
    progress::progress,
    AppState,
};

#[derive(Debug, Clone, Copy)]
struct StepForced {
    current: usize,
    total: usize,
}

/// Records the job as `InProgress(0)` and starts its background unit of work.
/// The returned handle only matters to tests; callers may drop it.
pub async fn submit(
    state: &AppState,
    job_id: String,
    request: GenerationRequest,
    temp_source: Option<TempSourceImage>,
) -> JoinHandle<()> {
    let request = Arc::new(request);
    state
        .jobs
        .create(&job_id, JobStatus::InProgress { progress: 0 }, request.clone())
        .await;

    info!(
        job_id = %job_id,
        model = %request.model,
        width = request.normalized_width(),
        height = request.normalized_height(),
        steps = request.normalized_steps(),
        image_to_image = request.init_image.is_some(),
        "Generation job submitted"
    );

    tokio::spawn(run_job(state.clone(), job_id, request, temp_source))
}

async fn run_job(
    state: AppState,
    job_id: String,
    request: Arc<GenerationRequest>,
    temp_source: Option<TempSourceImage>,
) {
    let outcome = generate(&state, &job_id, request).await;
    if let Some(temp) = temp_source {
        temp.remove().await;
    }

    match outcome {
        Ok(artifact) => {
            state
                .jobs
                .update(
                    &job_id,
                    JobStatus::Completed {
                        artifact_path: artifact.clone(),
                    },
                )
                .await;
            info!(job_id = %job_id, artifact = %artifact.display(), "Generation job completed");
            state.retention.on_completed(&job_id, artifact);
        }
        Err(err) => {
            error!("Generation job {job_id} failed: {err:#}");
            state
                .jobs
                .update(
                    &job_id,
                    JobStatus::Failed {
                        message: format!("{err:#}"),
                    },
                )
                .await;
        }
    }
}

/// Runs the engine on a blocking thread and republishes each forced step as
/// progress. Returns the path of the saved artifact.
async fn generate(
    state: &AppState,
    job_id: &str,
    request: Arc<GenerationRequest>,
) -> Result<PathBuf> {
    let output = artifact_path(&state.config.image_dir, job_id);
    let engine = state.engine.clone();
    let (step_tx, step_rx) = mpsc::unbounded_channel();

    let worker = {
        let output = output.clone();
        tokio::task::spawn_blocking(move || render(engine.as_ref(), &request, &output, step_tx))
    };

    let mut steps = UnboundedReceiverStream::new(step_rx);
    let mut published = 0u8;
    while let Some(StepForced { current, total }) = steps.next().await {
        // The raw table can dip after step 3; never move backwards.
        published = published.max(progress(current, total));
        state
            .jobs
            .update(job_id, JobStatus::InProgress { progress: published })
            .await;
        info!(
            job_id = %job_id,
            step = current,
            total,
            progress = published,
            "Generation progress update"
        );
    }

    worker.await.context("Generation worker panicked")??;
    Ok(output)
}

fn render(
    engine: &dyn GenerationEngine,
    request: &GenerationRequest,
    output: &Path,
    step_tx: mpsc::UnboundedSender<StepForced>,
) -> Result<()> {
    let config = GenerationConfig::from_request(request);
    // Also bounds the source resample below.
    check_output_size(config.width, config.height)?;

    let sequence = match &request.init_image {
        Some(path) => {
            let source = load_source_tensor(path, config.width, config.height)
                .context("Failed to load source image")?;
            engine
                .image_to_image(&config, source, request.normalized_strength())
                .context("Failed to start image-to-image generation")?
        }
        None => engine
            .text_to_image(&config)
            .context("Failed to start text-to-image generation")?,
    };

    let total = sequence.total();
    let mut last = None;
    for (index, step) in sequence.enumerate() {
        let latents = step.with_context(|| format!("Denoising step {} failed", index + 1))?;
        // A dropped receiver only means nobody is listening for progress.
        let _ = step_tx.send(StepForced {
            current: index + 1,
            total,
        });
        last = Some(latents);
    }
    drop(step_tx);

    let packed = last.context("Engine produced no denoising steps")?;
    let latents = unpack_latents(&packed, config.height, config.width)
        .context("Failed to unpack final latents")?;
    let decoded = engine.decode(latents).context("Failed to decode latents")?;
    RasterImage::from_tensor(&decoded)
        .and_then(|raster| raster.save(output))
        .context("Failed to save generated image")?;
    Ok(())
}
