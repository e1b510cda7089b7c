//! Shared test utilities for the heic-batch test suite.
//!
//! Provides synthetic image inputs, a scriptable [`Transcode`] stand-in for
//! exercising the scheduler and pipeline without real codecs, and a
//! recording [`BatchObserver`].
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let transcoder = Arc::new(ScriptedTranscoder::new());
//! transcoder.script("3.heic", [Step::Fail(ConversionError::Decode("corrupt".into()))]);
//! transcoder.script("slow.heic", [Step::Stall, Step::Succeed]);
//! // ... run a batch ...
//! assert_eq!(transcoder.max_in_flight(), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::Mutex;

use crate::scheduler::{BatchObserver, SchedulerEvent};
use crate::transcode::{ConversionError, ProgressReporter, Transcode};
use crate::types::{Artifact, ConversionTarget, ItemId, OutputFormat, SourceItem};

// =========================================================================
// Synthetic inputs
// =========================================================================

/// Bytes that pass the HEIC signature check but hold no real image.
pub fn fake_heic() -> Vec<u8> {
    let mut bytes = b"\0\0\0\x18ftypheic\0\0\0\0mif1heic".to_vec();
    bytes.extend(std::iter::repeat_n(0u8, 64));
    bytes
}

/// An RGB gradient so encoders have something non-trivial to compress.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    gradient(width, height).write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded(width, height, ImageFormat::Jpeg)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded(width, height, ImageFormat::Png)
}

// =========================================================================
// Scripted transcoder
// =========================================================================

/// What one attempt on a named source does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report some progress, finish after a short pause.
    Succeed,
    /// Like `Succeed`, but take this long.
    SucceedAfter(Duration),
    Fail(ConversionError),
    /// Report a little progress, then never finish.
    Stall,
}

/// One recorded `transcode` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub bytes: Bytes,
    pub format: OutputFormat,
    pub quality: f32,
}

/// [`Transcode`] driven by per-source scripts instead of codecs.
///
/// Sources without a script (or whose script ran out) succeed. The artifact
/// bytes are `name|format|quality`, so tests can tell which target produced
/// an artifact.
#[derive(Default)]
pub struct ScriptedTranscoder {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
    finished: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, name: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .insert(name.to_string(), steps.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Names of sources whose attempt completed, in completion order.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The bytes a successful attempt produces for `name` at `target`.
    pub fn expected_bytes(name: &str, target: ConversionTarget) -> Bytes {
        Bytes::from(format!(
            "{name}|{}|{}",
            target.format().extension(),
            target.quality().value()
        ))
    }

    fn next_step(&self, name: &str) -> Step {
        self.scripts
            .lock()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl Transcode for ScriptedTranscoder {
    async fn transcode(
        &self,
        source: &SourceItem,
        target: ConversionTarget,
        progress: &ProgressReporter,
    ) -> Result<Artifact, ConversionError> {
        self.calls.lock().push(Call {
            name: source.name.clone(),
            bytes: source.bytes.clone(),
            format: target.format(),
            quality: target.quality().value(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        progress.begin();
        let delay = match self.next_step(&source.name) {
            Step::Fail(err) => return Err(err),
            Step::Stall => {
                progress.report(10);
                std::future::pending::<()>().await;
                unreachable!()
            }
            Step::Succeed => Duration::from_millis(10),
            Step::SucceedAfter(delay) => delay,
        };

        progress.report(50);
        tokio::time::sleep(delay).await;
        progress.report(100);
        self.finished.lock().push(source.name.clone());
        Ok(Artifact {
            format: target.format(),
            bytes: Self::expected_bytes(&source.name, target),
        })
    }
}

// =========================================================================
// Recording observer
// =========================================================================

#[derive(Default)]
pub struct RecordingObserver {
    progress: Mutex<Vec<(ItemId, u8, u8)>>,
    completed: Mutex<Vec<ItemId>>,
    events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingObserver {
    pub fn progress_of(&self, id: ItemId) -> Vec<u8> {
        self.progress
            .lock()
            .iter()
            .filter(|(item, _, _)| *item == id)
            .map(|(_, p, _)| *p)
            .collect()
    }

    pub fn last_aggregate(&self) -> Option<u8> {
        self.progress.lock().last().map(|(_, _, agg)| *agg)
    }

    pub fn completed(&self) -> Vec<ItemId> {
        self.completed.lock().clone()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }
}

impl BatchObserver for RecordingObserver {
    fn on_progress(&self, id: ItemId, progress: u8, aggregate: u8) {
        self.progress.lock().push((id, progress, aggregate));
    }

    fn on_completed(&self, id: ItemId, _artifact: &Artifact) {
        self.completed.lock().push(id);
    }

    fn on_event(&self, event: SchedulerEvent) {
        self.events.lock().push(event);
    }
}
