//! Single-item transcoding.
//!
//! [`ImageTranscoder`] turns one [`SourceItem`] into an [`Artifact`]:
//!
//! ```text
//! detect ─┬─ HEIF ──────── HeifDecoder ──┬─ (decode failed) ─┐
//!         ├─ unknown ───── HeifDecoder ──┘                   │
//!         └─ known raster ───────────────── decode_raster ◄──┘
//!                                                │
//!                     JPEG / PNG ◄── encode ─────┤
//!                     WEBP ◄── encode ◄── decode ◄── encode PNG
//! ```
//!
//! The WEBP path goes through PNG first: decoded pixels are encoded as PNG,
//! decoded again, then encoded as WEBP at the requested quality.
//!
//! Progress is reported through a [`ProgressReporter`]. Milestones are coarse
//! (the decoders expose no byte-level progress), but every successful
//! transcode starts at 0 and ends with exactly 100.

use crate::imaging::{self, CodecError, HeifDecoder, encode::encode_png};
use crate::types::{Artifact, ConversionTarget, OutputFormat, SourceItem};
use async_trait::async_trait;
use bytes::Bytes;
use image::DynamicImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a single item could not be converted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("conversion stalled (no progress within {after:?})")]
    Stalled { after: Duration },
    #[error("could not encode image: {0}")]
    Encode(String),
    #[error("conversion worker failed: {0}")]
    Worker(String),
}

impl From<CodecError> for ConversionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(msg) | CodecError::Unsupported(msg) => ConversionError::Decode(msg),
            CodecError::Encode(msg) => ConversionError::Encode(msg),
        }
    }
}

type ProgressSink = Box<dyn Fn(u8) + Send + Sync>;

struct ReporterInner {
    value: AtomicU8,
    detached: AtomicBool,
    sink: ProgressSink,
}

/// Monotonic 0–100 progress channel for one transcode attempt.
///
/// Values are clamped to 100; anything not above the current value is
/// dropped. Once [`detach`](Self::detach)ed (an abandoned attempt), further
/// reports are ignored. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                value: AtomicU8::new(0),
                detached: AtomicBool::new(false),
                sink: Box::new(sink),
            }),
        }
    }

    /// A reporter nobody listens to.
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    /// Announce the start of an attempt. Emits 0 even though it is not an
    /// increase.
    pub fn begin(&self) {
        if !self.is_detached() && self.current() == 0 {
            (self.inner.sink)(0);
        }
    }

    pub fn report(&self, value: u8) {
        if self.is_detached() {
            return;
        }
        let value = value.min(100);
        let previous = self.inner.value.fetch_max(value, Ordering::SeqCst);
        if value > previous {
            (self.inner.sink)(value);
        }
    }

    pub fn current(&self) -> u8 {
        self.inner.value.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }
}

/// Anything that can convert one source to one artifact.
#[async_trait]
pub trait Transcode: Send + Sync {
    async fn transcode(
        &self,
        source: &SourceItem,
        target: ConversionTarget,
        progress: &ProgressReporter,
    ) -> Result<Artifact, ConversionError>;
}

/// Progress milestones of the production transcoder.
mod milestone {
    pub const SNIFFED: u8 = 5;
    pub const DECODED: u8 = 50;
    pub const PNG_HOP: u8 = 70;
    pub const ENCODED: u8 = 95;
}

/// Production transcoder: HEIF decoder plus `image`/`webp` encoders, with
/// the pixel work on tokio's blocking pool.
pub struct ImageTranscoder {
    decoder: Arc<dyn HeifDecoder>,
}

impl ImageTranscoder {
    pub fn new(decoder: Arc<dyn HeifDecoder>) -> Self {
        Self { decoder }
    }

    /// Transcoder using libheif when compiled in.
    pub fn native() -> Self {
        Self::new(Arc::new(imaging::NativeHeifDecoder::new()))
    }
}

#[async_trait]
impl Transcode for ImageTranscoder {
    async fn transcode(
        &self,
        source: &SourceItem,
        target: ConversionTarget,
        progress: &ProgressReporter,
    ) -> Result<Artifact, ConversionError> {
        progress.begin();
        let decoder = Arc::clone(&self.decoder);
        let bytes = source.bytes.clone();
        let name = source.name.clone();
        let reporter = progress.clone();

        let encoded = tokio::task::spawn_blocking(move || {
            transcode_blocking(decoder.as_ref(), &name, &bytes, target, &reporter)
        })
        .await
        .map_err(|e| ConversionError::Worker(format!("transcode task failed: {e}")))??;

        progress.report(100);
        Ok(Artifact {
            format: target.format(),
            bytes: Bytes::from(encoded),
        })
    }
}

/// Decode with the HEIF decoder, falling back to the generic raster path.
fn decode_source(
    decoder: &dyn HeifDecoder,
    name: &str,
    bytes: &[u8],
) -> Result<(DynamicImage, bool), ConversionError> {
    let detection = imaging::detect(bytes);
    if detection.is_known_raster() {
        debug!(file = name, mime = ?detection.actual_mime, "not HEIF, using raster decoder");
        let img = imaging::decode_raster(bytes)?;
        return Ok((img, false));
    }

    match decoder.decode(bytes) {
        Ok(img) => Ok((img, true)),
        Err(heif_err) => {
            debug!(file = name, error = %heif_err, "HEIF decode failed, trying raster fallback");
            match imaging::decode_raster(bytes) {
                Ok(img) => Ok((img, false)),
                Err(raster_err) => {
                    warn!(file = name, error = %raster_err, "raster fallback failed");
                    Err(ConversionError::Decode(format!("{heif_err}; fallback: {raster_err}")))
                }
            }
        }
    }
}

fn transcode_blocking(
    decoder: &dyn HeifDecoder,
    name: &str,
    bytes: &[u8],
    target: ConversionTarget,
    progress: &ProgressReporter,
) -> Result<Vec<u8>, ConversionError> {
    progress.report(milestone::SNIFFED);
    let (img, was_heif) = decode_source(decoder, name, bytes)?;
    progress.report(milestone::DECODED);

    let encoded = match target.format() {
        OutputFormat::Webp => {
            let png = encode_png(&img)?;
            drop(img);
            let pixels = imaging::decode_raster(&png)?;
            progress.report(milestone::PNG_HOP);
            imaging::encode(&pixels, OutputFormat::Webp, target.quality())?
        }
        format => imaging::encode(&img, format, target.quality())?,
    };
    progress.report(milestone::ENCODED);

    debug!(
        file = name,
        heif = was_heif,
        format = %target.format(),
        input = bytes.len(),
        output = encoded.len(),
        "transcoded"
    );
    Ok(encoded)
}
