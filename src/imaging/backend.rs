//! HEIF decoding backend trait and shared codec errors.
//!
//! The [`HeifDecoder`] trait is the seam between the transcoder and whatever
//! can actually decode HEVC-coded HEIF pixels. The production implementation
//! is [`NativeHeifDecoder`], backed by libheif when the `heif` cargo feature
//! is enabled. Without it every call reports [`CodecError::Unsupported`] and
//! the transcoder's generic raster fallback is the only decode path.

use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Decodes HEIC/HEIF bytes into pixels.
pub trait HeifDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError>;
}

/// libheif-backed decoder (feature `heif`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeHeifDecoder;

impl NativeHeifDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Whether this build can decode HEVC-coded HEIF at all.
    pub fn is_available() -> bool {
        cfg!(feature = "heif")
    }
}

#[cfg(feature = "heif")]
impl HeifDecoder for NativeHeifDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        use image::ImageReader;
        use std::io::Cursor;
        use std::sync::Once;

        static HOOKS: Once = Once::new();
        HOOKS.call_once(|| {
            libheif_rs::integration::image::register_all_decoding_hooks();
        });

        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::Decode(format!("failed to read HEIF header: {e}")))?
            .decode()
            .map_err(|e| CodecError::Decode(format!("failed to decode HEIF: {e}")))
    }
}

#[cfg(not(feature = "heif"))]
impl HeifDecoder for NativeHeifDecoder {
    fn decode(&self, _bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        Err(CodecError::Unsupported(
            "built without the `heif` feature; HEVC decoding is unavailable".into(),
        ))
    }
}
