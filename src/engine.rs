use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{bail, Result};
use ndarray::{Array1, Array3, Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    codec::{
        denormalize, pack_latents, LatentImage, PackedLatents, Tensor, LATENT_CHANNELS,
        PACKED_CHANNELS,
    },
    models::{GenerationRequest, ModelVariant, MAX_DIMENSION},
};

/// Resolved parameters for one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub seed: u64,
    pub model: ModelVariant,
    pub float16: bool,
    pub quantize: bool,
    pub lora_path: Option<PathBuf>,
}

impl GenerationConfig {
    /// Uses the request's normalized fields; a missing seed is drawn at random.
    pub fn from_request(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            width: request.normalized_width(),
            height: request.normalized_height(),
            steps: request.normalized_steps(),
            guidance: request.normalized_guidance(),
            seed: request.seed.unwrap_or_else(rand::random),
            model: request.model,
            float16: request.float16,
            quantize: request.quantize,
            lora_path: request.lora_path.clone(),
        }
    }
}

/// Forward-only sequence of intermediate latents, one per denoising step.
/// Pulling an element is where the engine does its work.
pub struct StepSequence {
    total: usize,
    steps: Box<dyn Iterator<Item = Result<PackedLatents>> + Send>,
}

impl StepSequence {
    pub fn new<I>(total: usize, steps: I) -> Self
    where
        I: Iterator<Item = Result<PackedLatents>> + Send + 'static,
    {
        Self {
            total,
            steps: Box::new(steps.take(total)),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for StepSequence {
    type Item = Result<PackedLatents>;

    fn next(&mut self) -> Option<Self::Item> {
        self.steps.next()
    }
}

/// The inference backend. Implementations are called from blocking threads.
pub trait GenerationEngine: Send + Sync + 'static {
    fn text_to_image(&self, config: &GenerationConfig) -> Result<StepSequence>;

    /// `source` is a normalized (H, W, 3) tensor at the configured size;
    /// `strength` in 0..1 is how much of it survives into the result.
    fn image_to_image(
        &self,
        config: &GenerationConfig,
        source: Tensor,
        strength: f32,
    ) -> Result<StepSequence>;

    /// Turns unpacked latents into a displayable 0..1 (H, W, 3) tensor.
    fn decode(&self, latents: LatentImage) -> Result<Tensor>;
}

/// Deterministic stand-in for a diffusion model: seeded noise relaxed toward a
/// prompt-derived palette, decoded by 8x nearest-neighbour upsampling.
#[derive(Debug, Clone, Default)]
pub struct ProceduralEngine {
    step_delay: Duration,
}

impl ProceduralEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    fn prepare(&self, config: &GenerationConfig) -> Result<(usize, usize)> {
        check_output_size(config.width, config.height)?;
        if let Some(path) = &config.lora_path {
            if !path.is_file() {
                bail!("adapter weights not found at {}", path.display());
            }
        }
        info!(
            model = %config.model,
            width = config.width,
            height = config.height,
            steps = config.steps,
            seed = config.seed,
            float16 = config.float16,
            quantize = config.quantize,
            lora = config.lora_path.is_some(),
            "Engine prepared"
        );
        Ok((config.height as usize / 16, config.width as usize / 16))
    }

    fn sequence(
        &self,
        config: &GenerationConfig,
        start: PackedLatents,
        target: PackedLatents,
    ) -> StepSequence {
        let total = config.steps as usize;
        let delay = self.step_delay;
        let sharpness = 0.5 + config.guidance / 10.0;
        let steps = (1..=total).map(move |step| {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let t = (step as f32 / total as f32).powf(1.0 / sharpness);
            debug!(step, total, "Forcing denoising step");
            Ok(&start * (1.0 - t) + &target * t)
        });
        StepSequence::new(total, steps)
    }
}

impl GenerationEngine for ProceduralEngine {
    fn text_to_image(&self, config: &GenerationConfig) -> Result<StepSequence> {
        let (h, w) = self.prepare(config)?;
        let noise = seeded_noise(config.seed, h * w);
        let target = palette_latents(&config.prompt, config.model, h, w);
        Ok(self.sequence(config, noise, target))
    }

    fn image_to_image(
        &self,
        config: &GenerationConfig,
        source: Tensor,
        strength: f32,
    ) -> Result<StepSequence> {
        let (h, w) = self.prepare(config)?;
        let (rows, cols, _) = source.dim();
        if rows != h * 16 || cols != w * 16 {
            bail!(
                "source tensor {rows}x{cols} does not match output size {}x{}",
                config.height,
                config.width
            );
        }
        let encoded = encode_source(&source)?;
        let noise = seeded_noise(config.seed, h * w);
        let palette = palette_latents(&config.prompt, config.model, h, w);
        let start = &encoded * strength + &noise * (1.0 - strength);
        let target = &encoded * strength + &palette * (1.0 - strength);
        Ok(self.sequence(config, start, target))
    }

    fn decode(&self, latents: LatentImage) -> Result<Tensor> {
        let (batch, rows, cols, channels) = latents.dim();
        if batch != 1 || channels != LATENT_CHANNELS {
            bail!("cannot decode latents of shape {:?}", latents.shape());
        }
        let latents = latents.index_axis_move(Axis(0), 0);
        // Each output colour averages the latent channels congruent to it mod 3.
        let colours = Array3::from_shape_fn((rows, cols, 3), |(y, x, k)| {
            let channel = latents.slice(ndarray::s![y, x, ..]);
            let (sum, count) = channel
                .iter()
                .enumerate()
                .filter(|(c, _)| c % 3 == k)
                .fold((0.0f32, 0usize), |(s, n), (_, v)| (s + v, n + 1));
            sum / count as f32
        });
        Ok(Array3::from_shape_fn((rows * 8, cols * 8, 3), |(y, x, k)| {
            denormalize(colours[[y / 8, x / 8, k]])
        }))
    }
}

/// Rejects output sizes the engine cannot allocate latents for. Both edges
/// must be multiples of 16 within `64..=MAX_DIMENSION`.
pub fn check_output_size(width: u32, height: u32) -> Result<()> {
    let aligned = width % 16 == 0 && height % 16 == 0;
    let in_range = |edge: u32| (64..=MAX_DIMENSION).contains(&edge);
    if !aligned || !in_range(width) || !in_range(height) {
        bail!(
            "unsupported output size {width}x{height}: both edges must be multiples of 16 \
             between 64 and {MAX_DIMENSION}"
        );
    }
    Ok(())
}

fn seeded_noise(seed: u64, tokens: usize) -> PackedLatents {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_simple_fn((1, tokens, PACKED_CHANNELS), || {
        rng.random_range(-1.0f32..1.0)
    })
}

fn palette_latents(prompt: &str, model: ModelVariant, h: usize, w: usize) -> PackedLatents {
    let mut hasher = DefaultHasher::new();
    prompt.trim().to_lowercase().hash(&mut hasher);
    model.as_str().hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());
    let palette: Array1<f32> =
        Array1::from_shape_simple_fn(PACKED_CHANNELS, || rng.random_range(-0.8f32..0.8));

    Array3::from_shape_fn((1, h * w, PACKED_CHANNELS), |(_, token, k)| {
        let row = (token / w) as f32 / h.max(1) as f32;
        let col = (token % w) as f32 / w.max(1) as f32;
        let shade = 0.75 + 0.25 * ((row + col) * std::f32::consts::PI).cos();
        palette[k] * shade
    })
}

/// Averages each 8x8 block of the source into the latent grid, spreading the
/// RGB values across the latent channels, then packs it.
fn encode_source(source: &Tensor) -> Result<PackedLatents> {
    let (rows, cols, channels) = source.dim();
    let (lh, lw) = (rows / 8, cols / 8);
    let latents = Array4::from_shape_fn((1, lh, lw, LATENT_CHANNELS), |(_, y, x, c)| {
        let k = (c % 3).min(channels.saturating_sub(1));
        let block = source.slice(ndarray::s![y * 8..y * 8 + 8, x * 8..x * 8 + 8, k]);
        block.mean().unwrap_or(0.0)
    });
    Ok(pack_latents(&latents)?)
}
