//! Inline image optimization: bounded decode, rescale, JPEG re-encode.

use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as base64engine;
use image::RgbImage;
use image::imageops::FilterType;
use mozjpeg::{ColorSpace, Compress};

/// Bounds applied to every uploaded image.
#[derive(Clone, Debug)]
pub struct ImageLimits {
    /// Maximum decoded payload size in bytes.
    pub max_bytes: usize,
    /// Bounding box edge for the rescale, in pixels.
    pub max_dimension: u32,
    /// JPEG re-encode quality, 1-100.
    pub jpeg_quality: u8,
}

/// Decode a `data:image/...;base64` payload, scale it to fit within the
/// bounding box, and re-encode it as a metadata-free progressive JPEG
/// data URL.
///
/// The decoded payload may exceed the configured cap by 5%, absorbing
/// client-side rounding of the pre-encode size estimate.
pub fn optimize_data_url(data_url: &str, limits: &ImageLimits) -> Result<String> {
    let payload = split_data_url(data_url)?;
    let raw = base64engine
        .decode(payload)
        .context("invalid image format: bad base64 payload")?;
    let slack = limits.max_bytes + limits.max_bytes / 20;
    if raw.len() > slack {
        bail!(
            "image too large: {} bytes exceeds the {} byte limit",
            raw.len(),
            limits.max_bytes
        );
    }
    let decoded = image::load_from_memory(&raw).context("unsupported or corrupt image data")?;
    let bounded = if decoded.width() > limits.max_dimension
        || decoded.height() > limits.max_dimension
    {
        decoded.resize(limits.max_dimension, limits.max_dimension, FilterType::Triangle)
    } else {
        decoded
    };
    // Re-encoding from decoded pixels drops every metadata segment. JPEG has
    // no alpha channel, so flatten to RGB first.
    let jpeg = encode_progressive_jpeg(&bounded.to_rgb8(), limits.jpeg_quality)?;
    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64engine.encode(&jpeg)
    ))
}

/// Progressive JPEG encode of raw RGB pixels.
///
/// libjpeg reports failure by unwinding; contain it to this image.
fn encode_progressive_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = rgb.dimensions();
    catch_unwind(AssertUnwindSafe(|| -> std::io::Result<Vec<u8>> {
        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(f32::from(quality));
        comp.set_progressive_mode();
        let mut started = comp.start_compress(Vec::new())?;
        started.write_scanlines(rgb.as_raw())?;
        started.finish()
    }))
    .map_err(|_| anyhow!("failed to encode JPEG"))?
    .context("failed to encode JPEG")
}

/// Extract the base64 payload from a `data:image/<subtype>;base64,` URL.
fn split_data_url(data_url: &str) -> Result<&str> {
    let rest = data_url
        .strip_prefix("data:image/")
        .context("invalid image format: expected a data:image/ URL")?;
    let (subtype, payload) = rest
        .split_once(";base64,")
        .context("invalid image format: missing base64 marker")?;
    if subtype.is_empty()
        || !subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        bail!("invalid image format: bad media subtype");
    }
    Ok(payload)
}
