//! End-to-end flows through the public API with the real transcoder.
//!
//! HEIF decoding is provided by `SyntheticHeif`, a decoder that turns any
//! input with a HEIC signature into a small gradient, so these tests run
//! without libheif. Everything after decoding (encoders, WEBP two-hop,
//! scheduling, handles, naming) is the production code.

use async_trait::async_trait;
use bytes::Bytes;
use heic_batch::config::{self, PipelineConfig};
use heic_batch::imaging::{CodecError, HeifDecoder, detect};
use heic_batch::pipeline::{Notification, Pipeline, PipelineError};
use heic_batch::preferences::{MemoryPreferences, Preferences, TomlPreferences};
use heic_batch::transcode::{ConversionError, ImageTranscoder, ProgressReporter, Transcode};
use heic_batch::types::{Artifact, ConversionTarget, OutputFormat, SourceItem};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

const CORRUPT_MARKER: &[u8] = b"CORRUPT";

struct SyntheticHeif;

impl HeifDecoder for SyntheticHeif {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        if !detect(bytes).is_expected_container {
            return Err(CodecError::Decode("no ftyp box".into()));
        }
        if bytes.windows(CORRUPT_MARKER.len()).any(|w| w == CORRUPT_MARKER) {
            return Err(CodecError::Decode("truncated hvcC box".into()));
        }
        Ok(DynamicImage::ImageRgb8(RgbImage::from_fn(32, 24, |x, y| {
            image::Rgb([(x * 8) as u8, (y * 10) as u8, 128])
        })))
    }
}

/// Succeeds immediately without touching pixels.
struct InstantTranscoder;

#[async_trait]
impl Transcode for InstantTranscoder {
    async fn transcode(
        &self,
        source: &SourceItem,
        target: ConversionTarget,
        progress: &ProgressReporter,
    ) -> Result<Artifact, ConversionError> {
        progress.begin();
        progress.report(100);
        Ok(Artifact {
            format: target.format(),
            bytes: source.bytes.clone(),
        })
    }
}

fn heic(name: &str) -> SourceItem {
    let mut bytes = b"\0\0\0\x18ftypheic\0\0\0\0mif1heic".to_vec();
    bytes.extend_from_slice(&[0u8; 32]);
    SourceItem::new(name, bytes)
}

fn corrupt_heic(name: &str) -> SourceItem {
    let mut item = heic(name);
    let mut bytes = item.bytes.to_vec();
    bytes.extend_from_slice(CORRUPT_MARKER);
    item.bytes = Bytes::from(bytes);
    item
}

fn real_jpeg(name: &str) -> SourceItem {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(20, 10, |x, _| {
        image::Rgb([(x * 12) as u8, 90, 30])
    }));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
    SourceItem::new(name, buf.into_inner())
}

fn pipeline() -> Pipeline {
    Pipeline::with_defaults(Arc::new(ImageTranscoder::new(Arc::new(SyntheticHeif))))
}

// =========================================================================
// Conversion
// =========================================================================

#[tokio::test]
async fn corrupt_file_does_not_affect_the_rest() {
    let p = pipeline();
    let files = vec![
        heic("1.heic"),
        heic("2.heic"),
        corrupt_heic("3.heic"),
        heic("4.heic"),
        heic("5.heic"),
    ];

    let run = p.submit_files(files).await.unwrap().run.unwrap();

    assert_eq!(run.succeeded, 4);
    assert_eq!(run.failed.len(), 1);
    assert_eq!(run.failed[0].name, "3.heic");
    assert!(matches!(run.failed[0].reason, ConversionError::Decode(_)));

    let downloads = p.downloads();
    let names: Vec<&str> = downloads.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["1.jpg", "2.jpg", "4.jpg", "5.jpg"]);
    for (_, artifact) in &downloads {
        assert_eq!(detect(&artifact.bytes).actual_mime, Some("image/jpeg"));
    }
}

#[tokio::test]
async fn format_switch_reencodes_every_item() {
    let p = pipeline();
    p.submit_files(vec![heic("a.heic"), heic("b.heic")]).await.unwrap();

    p.set_format(OutputFormat::Webp).await.unwrap();
    for (name, artifact) in p.downloads() {
        assert!(name.ends_with(".webp"), "{name}");
        assert_eq!(detect(&artifact.bytes).actual_mime, Some("image/webp"));
    }

    p.set_format(OutputFormat::Png).await.unwrap();
    for (name, artifact) in p.downloads() {
        assert!(name.ends_with(".png"), "{name}");
        let decoded = image::load_from_memory(&artifact.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
    assert_eq!(p.registry_stats().live, 2);
}

#[tokio::test]
async fn lower_quality_gives_smaller_jpeg() {
    let p = pipeline();
    p.submit_files(vec![heic("q.heic")]).await.unwrap();
    let high = p.downloads()[0].1.len();

    p.set_quality(0.1).await.unwrap();
    let low = p.downloads()[0].1.len();

    assert!(low < high, "{low} >= {high}");
}

#[tokio::test]
async fn misnamed_jpeg_converts_without_heif_support() {
    let p = Pipeline::with_defaults(Arc::new(ImageTranscoder::native()));
    let mut rx = p.subscribe();

    let run = p
        .submit_files(vec![real_jpeg("IMG_9.HEIC")])
        .await
        .unwrap()
        .run
        .unwrap();

    assert_eq!(run.succeeded, 1);
    let mut complete = None;
    while let Ok(n) = rx.try_recv() {
        if let Notification::ConversionComplete {
            includes_non_heic, ..
        } = n
        {
            complete = Some(includes_non_heic);
        }
    }
    assert_eq!(complete, Some(true));
    assert_eq!(p.downloads()[0].0, "IMG_9.jpg");
}

// =========================================================================
// Batch management
// =========================================================================

#[tokio::test]
async fn cap_is_enforced_against_config() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("config.toml");
    std::fs::write(&config_path, "[batch]\nchunk_pause_ms = 0\n").unwrap();
    let config = config::load_config(Some(&config_path)).unwrap();

    let p = Pipeline::new(
        &config,
        Arc::new(InstantTranscoder),
        Arc::new(MemoryPreferences::new()),
    )
    .unwrap();
    assert_eq!(p.max_files(), 30);
    let files: Vec<SourceItem> = (0..35).map(|i| heic(&format!("{i}.heic"))).collect();

    let report = p.submit_files(files).await.unwrap();

    assert_eq!(report.accepted.len(), 30);
    assert_eq!(report.excluded, 5);
    assert!(matches!(
        p.submit_files(vec![heic("extra.heic")]).await,
        Err(PipelineError::OverCapacity { limit: 30 })
    ));
}

#[tokio::test]
async fn rename_then_reset() {
    let p = pipeline();
    let report = p.submit_files(vec![heic("x.heic"), heic("y.heic")]).await.unwrap();

    assert_eq!(p.rename(report.accepted[0], "My Photo").unwrap(), "My Photo.jpg");
    assert_eq!(p.rename(report.accepted[1], "  ").unwrap(), "image.jpg");
    let handles: Vec<_> = p
        .snapshot()
        .items
        .into_iter()
        .filter_map(|i| i.preview_handle)
        .collect();

    p.reset();

    assert!(p.snapshot().items.is_empty());
    assert!(handles.iter().all(|h| p.preview(h).is_none()));
    assert_eq!(p.registry_stats().live, 0);
}

#[tokio::test]
async fn preferences_persist_across_pipelines() {
    let tmp = TempDir::new().unwrap();
    let prefs_path = tmp.path().join("prefs.toml");
    let config = PipelineConfig::default();

    {
        let prefs: Arc<dyn Preferences> = Arc::new(TomlPreferences::new(&prefs_path));
        let p = Pipeline::new(&config, Arc::new(InstantTranscoder), prefs).unwrap();
        p.set_format(OutputFormat::Webp).await.unwrap();
        p.set_quality(0.65).await.unwrap();
    }

    let prefs: Arc<dyn Preferences> = Arc::new(TomlPreferences::new(&prefs_path));
    let p = Pipeline::new(&config, Arc::new(InstantTranscoder), prefs).unwrap();
    let target = p.target();
    assert_eq!(target.format(), OutputFormat::Webp);
    assert_eq!(target.quality().value(), 0.65);
}
