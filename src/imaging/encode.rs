//! Raster decode/encode on top of the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP, GIF) | `image::ImageReader` with guessed format |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` (quality 1–100) |
//! | Encode → PNG | `image::codecs::png::PngEncoder` (lossless) |
//! | Encode → WEBP | `webp` (libwebp, lossy at the requested quality) |
//!
//! The `image` crate's own WebP encoder is lossless-only, which would make the
//! user's quality meaningless for WEBP targets, hence libwebp.

use super::backend::CodecError;
use super::params::Quality;
use crate::types::OutputFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageReader};
use std::io::Cursor;

/// Decode any raster format the `image` crate was built with.
pub fn decode_raster(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(format!("failed to sniff format: {e}")))?
        .decode()
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode to `format`. PNG ignores `quality`.
pub fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: Quality,
) -> Result<Vec<u8>, CodecError> {
    match format {
        OutputFormat::Jpeg => encode_jpeg(img, quality),
        OutputFormat::Png => encode_png(img),
        OutputFormat::Webp => encode_webp(img, quality),
    }
}

/// JPEG has no alpha channel; transparent pixels are flattened by dropping it.
pub fn encode_jpeg(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, CodecError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.percent())
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| CodecError::Encode(format!("JPEG encode failed: {e}")))?;
    Ok(out)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    let encoder = PngEncoder::new(&mut out);
    let result = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        encoder.write_image(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
    } else {
        let rgb = img.to_rgb8();
        encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
    };
    result.map_err(|e| CodecError::Encode(format!("PNG encode failed: {e}")))?;
    Ok(out)
}

pub fn encode_webp(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, CodecError> {
    let rgba = img.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(CodecError::Encode("WEBP encode failed: empty image".into()));
    }
    let encoded = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
        .encode_simple(false, f32::from(quality.percent()))
        .map_err(|e| CodecError::Encode(format!("WEBP encode failed: {e:?}")))?;
    Ok(encoded.to_vec())
}
