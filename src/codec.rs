use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use ndarray::{s, Array3, Array4};
use thiserror::Error;

/// (H, W, C) floating point samples, normalized to -1..1 on the way into the
/// engine and 0..1 on the way out of its decoder.
pub type Tensor = Array3<f32>;

/// Engine-native latent layout: (1, H/16 * W/16, 64).
pub type PackedLatents = Array3<f32>;

/// Spatial latent layout handed to the decoder: (1, H/8, W/8, 16).
pub type LatentImage = Array4<f32>;

pub const LATENT_CHANNELS: usize = 16;
pub const PACKED_CHANNELS: usize = LATENT_CHANNELS * 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to open image {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to decode image bytes: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to save image {}: {source}", .path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid tensor shape: {0}")]
    Shape(String),
    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Dense 8-bit (H, W, C) buffer, C in {3, 4}, channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pixels: Array3<u8>,
}

impl RasterImage {
    pub fn from_pixels(pixels: Array3<u8>) -> Result<Self, CodecError> {
        let channels = pixels.dim().2;
        if channels != 3 && channels != 4 {
            return Err(CodecError::Shape(format!(
                "raster must have 3 or 4 channels, got {channels}"
            )));
        }
        Ok(Self { pixels })
    }

    /// Opens an image file. With `max_edge`, the longer edge is scaled to it
    /// first; both dimensions are then floored to a multiple of 64.
    pub fn open(path: &Path, max_edge: Option<u32>) -> Result<Self, CodecError> {
        let image = image::open(path).map_err(|source| CodecError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_dynamic(&image, max_edge)
    }

    pub fn decode(bytes: &[u8], max_edge: Option<u32>) -> Result<Self, CodecError> {
        let image = image::load_from_memory(bytes).map_err(CodecError::Decode)?;
        Self::from_dynamic(&image, max_edge)
    }

    /// Opens an image file and resamples it to exactly `width` x `height`.
    pub fn open_resized(path: &Path, width: u32, height: u32) -> Result<Self, CodecError> {
        let image = image::open(path).map_err(|source| CodecError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::rasterize(&image, width, height)
    }

    fn from_dynamic(image: &DynamicImage, max_edge: Option<u32>) -> Result<Self, CodecError> {
        let (width, height) = scaled_dimensions(image.width(), image.height(), max_edge);
        let width = width - width % 64;
        let height = height - height % 64;
        if width == 0 || height == 0 {
            return Err(CodecError::Shape(format!(
                "image {}x{} is smaller than 64 pixels on one edge",
                image.width(),
                image.height()
            )));
        }
        Self::rasterize(image, width, height)
    }

    fn rasterize(image: &DynamicImage, width: u32, height: u32) -> Result<Self, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::Shape(format!(
                "cannot rasterize to {width}x{height}"
            )));
        }
        let rgba = if image.width() == width && image.height() == height {
            image.to_rgba8()
        } else {
            image
                .resize_exact(width, height, FilterType::Lanczos3)
                .to_rgba8()
        };
        let rgba = Array3::from_shape_vec((height as usize, width as usize, 4), rgba.into_raw())?;
        let rgb = rgba.slice(s![.., .., 0..3]).to_owned();
        Ok(Self { pixels: rgb })
    }

    /// Quantizes a 0..1 tensor. Three-channel input gets an opaque alpha
    /// channel appended.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self, CodecError> {
        let (height, width, channels) = tensor.dim();
        if channels != 3 && channels != 4 {
            return Err(CodecError::Shape(format!(
                "tensor must have 3 or 4 channels, got {channels}"
            )));
        }
        let pixels = Array3::from_shape_fn((height, width, 4), |(y, x, c)| {
            if c < channels {
                quantize(tensor[[y, x, c]])
            } else {
                u8::MAX
            }
        });
        Ok(Self { pixels })
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    /// Normalized -1..1 tensor for the engine.
    pub fn to_tensor(&self) -> Tensor {
        self.pixels.mapv(|v| normalize(f32::from(v) / 255.0))
    }

    /// Hands the pixel buffer over to an `RgbaImage`. The buffer moves into the
    /// image and is released when the image is dropped.
    pub fn into_rgba8(self) -> Result<RgbaImage, CodecError> {
        let (height, width, channels) = self.pixels.dim();
        let mut pixels = if channels == 3 {
            Array3::from_shape_fn((height, width, 4), |(y, x, c)| {
                if c < 3 {
                    self.pixels[[y, x, c]]
                } else {
                    u8::MAX
                }
            })
        } else {
            self.pixels
        };
        if !pixels.is_standard_layout() {
            pixels = pixels.as_standard_layout().into_owned();
        }
        let (raw, _) = pixels.into_raw_vec_and_offset();
        RgbaImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
            CodecError::Shape(format!("buffer does not fit {width}x{height} RGBA"))
        })
    }

    /// Writes the raster to `path`. The container is chosen from the extension,
    /// falling back to PNG.
    pub fn save(self, path: &Path) -> Result<(), CodecError> {
        let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
        let rgba = self.into_rgba8()?;
        let result = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgba8(rgba)
                .to_rgb8()
                .save_with_format(path, format),
            _ => rgba.save_with_format(path, format),
        };
        result.map_err(|source| CodecError::Save {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn scaled_dimensions(width: u32, height: u32, max_edge: Option<u32>) -> (u32, u32) {
    let Some(max_edge) = max_edge else {
        return (width, height);
    };
    let longer = width.max(height);
    if longer == 0 {
        return (width, height);
    }
    let scale = f64::from(max_edge) / f64::from(longer);
    (
        (f64::from(width) * scale).round() as u32,
        (f64::from(height) * scale).round() as u32,
    )
}

fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// 0..1 to -1..1.
pub fn normalize(value: f32) -> f32 {
    value * 2.0 - 1.0
}

/// -1..1 to 0..1, clamped.
pub fn denormalize(value: f32) -> f32 {
    (value / 2.0 + 0.5).clamp(0.0, 1.0)
}

/// Opens a source image at the exact generation size as a normalized tensor.
pub fn load_source_tensor(path: &Path, width: u32, height: u32) -> Result<Tensor, CodecError> {
    Ok(RasterImage::open_resized(path, width, height)?.to_tensor())
}

/// Reverses the 2x2 patchification of engine latents:
/// (1, h*w, 64) -> (1, h, w, 16, 2, 2) -> axes (0,1,4,2,5,3) -> (1, 2h, 2w, 16)
/// where h = height/16 and w = width/16.
pub fn unpack_latents(
    packed: &PackedLatents,
    height: u32,
    width: u32,
) -> Result<LatentImage, CodecError> {
    let h = height as usize / 16;
    let w = width as usize / 16;
    let expected = h * w * PACKED_CHANNELS;
    if h == 0 || w == 0 || packed.len() != expected {
        return Err(CodecError::Shape(format!(
            "packed latents {:?} do not match a {width}x{height} image",
            packed.shape()
        )));
    }

    let blocks = packed
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((1, h, w, LATENT_CHANNELS, 2, 2))?;
    let spatial = blocks.permuted_axes([0, 1, 4, 2, 5, 3]);
    Ok(spatial
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((1, h * 2, w * 2, LATENT_CHANNELS))?)
}

/// Inverse of [`unpack_latents`].
pub fn pack_latents(latents: &LatentImage) -> Result<PackedLatents, CodecError> {
    let (batch, rows, cols, channels) = latents.dim();
    if batch != 1 || channels != LATENT_CHANNELS || rows % 2 != 0 || cols % 2 != 0 {
        return Err(CodecError::Shape(format!(
            "cannot pack latents of shape {:?}",
            latents.shape()
        )));
    }
    let (h, w) = (rows / 2, cols / 2);

    let spatial = latents
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((1, h, 2, w, 2, LATENT_CHANNELS))?;
    let blocks = spatial.permuted_axes([0, 1, 3, 5, 2, 4]);
    Ok(blocks
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((1, h * w, PACKED_CHANNELS))?)
}

/// Strips a leading `data:image/<subtype>;base64,` prefix when present.
pub fn strip_data_uri_prefix(payload: &str) -> &str {
    let trimmed = payload.trim_start();
    let Some(rest) = trimmed.strip_prefix("data:image/") else {
        return trimmed;
    };
    let Some((subtype, body)) = rest.split_once(";base64,") else {
        return trimmed;
    };
    if !subtype.is_empty()
        && subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        body
    } else {
        trimmed
    }
}

pub fn decode_base64_image(payload: &str) -> Result<Vec<u8>, CodecError> {
    let body: String = strip_data_uri_prefix(payload)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(body)?)
}
