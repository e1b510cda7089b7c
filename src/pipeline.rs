//! The batch controller.
//!
//! [`Pipeline`] owns the visible item list, the current target and the
//! preview handles, and turns caller actions into scheduler runs:
//!
//! | Action | Effect |
//! |---|---|
//! | [`submit_files`](Pipeline::submit_files) | accept up to the remaining capacity, convert the new items |
//! | [`set_format`](Pipeline::set_format) | reconvert every item from its original bytes |
//! | [`set_quality`](Pipeline::set_quality) | same, for the current lossy format |
//! | [`rename`](Pipeline::rename) / [`remove`](Pipeline::remove) | per item, no conversion |
//! | [`reset`](Pipeline::reset) / [`close`](Pipeline::close) | drop every item and handle |
//!
//! ## Consistency rules
//!
//! - An item shows progress 100 only once its artifact is published.
//! - A reconversion pass first retires every handle, so the visible set never
//!   mixes artifacts of two targets. Items that fail are dropped from the set
//!   and reported.
//! - Only one run at a time: format, quality and submit calls made while a
//!   run is in flight fail with [`PipelineError::Busy`].
//! - [`reset`](Pipeline::reset) does not cancel a run. It bumps a generation
//!   counter; when the stale run settles its results are discarded.
//!
//! All item mutations go through one state mutex, never held across an await.

use crate::artifacts::{ArtifactRegistry, PreviewHandle, RegistryStats};
use crate::config::PipelineConfig;
use crate::imaging::{self, InvalidQuality, PNG_QUALITY, Quality};
use crate::naming;
use crate::preferences::{MemoryPreferences, Preferences, PreferencesError, StoredPreferences};
use crate::scheduler::{
    BatchObserver, BatchScheduler, FailedItem, Job, ReclaimHook, SchedulerEvent,
};
use crate::transcode::{ConversionError, Transcode};
use crate::types::{Artifact, ConversionTarget, ItemId, OutputFormat, SourceItem};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("batch is full ({limit} files maximum)")]
    OverCapacity { limit: usize },
    #[error("a conversion is already running")]
    Busy,
    #[error("no item with id {0}")]
    UnknownItem(ItemId),
    #[error(transparent)]
    InvalidQuality(#[from] InvalidQuality),
    #[error("PNG quality is fixed")]
    FixedQuality,
    #[error("preferences error: {0}")]
    Preferences(#[from] PreferencesError),
    #[error("pipeline is closed")]
    Closed,
}

/// What started a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionTrigger {
    Submit,
    Format,
    Quality,
}

/// Events for whoever presents the pipeline to a user.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BatchAccepted {
        accepted: usize,
        excluded: usize,
        limit: usize,
    },
    ConversionStarted {
        trigger: ConversionTrigger,
        count: usize,
    },
    ConversionComplete {
        trigger: ConversionTrigger,
        target: ConversionTarget,
        succeeded: usize,
        failed: usize,
        /// Some inputs were not HEIC/HEIF and went through the raster path.
        includes_non_heic: bool,
    },
    ItemFailed {
        id: ItemId,
        name: String,
        reason: ConversionError,
    },
    StallRetry {
        id: ItemId,
        name: String,
        attempt: u32,
    },
    StallRetryExhausted {
        id: ItemId,
        name: String,
    },
}

/// Public view of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemView {
    pub id: ItemId,
    pub display_name: String,
    pub preview_handle: Option<PreviewHandle>,
    pub progress: u8,
    pub has_artifact: bool,
    pub artifact_len: Option<usize>,
}

/// Public view of the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSnapshot {
    pub items: Vec<ItemView>,
    pub format: OutputFormat,
    pub quality: f32,
    pub is_converting: bool,
    pub aggregate_progress: u8,
    pub total_count: usize,
    pub completed_count: usize,
}

/// Result of one conversion run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub trigger: ConversionTrigger,
    pub target: ConversionTarget,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
    /// The batch was reset while this run was in flight; nothing was published.
    pub discarded: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitReport {
    pub accepted: Vec<ItemId>,
    /// Files left out because the batch was full.
    pub excluded: usize,
    pub run: Option<RunSummary>,
}

struct ItemState {
    id: ItemId,
    source: SourceItem,
    is_heif: bool,
    display_name: String,
    handle: Option<PreviewHandle>,
    artifact_len: Option<usize>,
    progress: u8,
}

impl ItemState {
    fn view(&self) -> ItemView {
        ItemView {
            id: self.id,
            display_name: self.display_name.clone(),
            preview_handle: self.handle.clone(),
            progress: self.progress,
            has_artifact: self.handle.is_some(),
            artifact_len: self.artifact_len,
        }
    }

    fn clear_artifact(&mut self) {
        self.handle = None;
        self.artifact_len = None;
        self.progress = 0;
    }
}

struct PipelineState {
    items: Vec<ItemState>,
    format: OutputFormat,
    jpeg_quality: Quality,
    webp_quality: Quality,
    converting: bool,
    aggregate: u8,
    generation: u64,
    closed: bool,
}

impl PipelineState {
    fn quality(&self) -> Quality {
        match self.format {
            OutputFormat::Jpeg => self.jpeg_quality,
            OutputFormat::Webp => self.webp_quality,
            OutputFormat::Png => PNG_QUALITY,
        }
    }

    fn target(&self) -> ConversionTarget {
        ConversionTarget::new(self.format, self.quality())
    }

    fn item_mut(&mut self, id: ItemId) -> Option<&mut ItemState> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    fn stored(&self) -> StoredPreferences {
        StoredPreferences {
            format: Some(self.format),
            jpeg_quality: Some(self.jpeg_quality),
            webp_quality: Some(self.webp_quality),
        }
    }

    /// Fail fast on calls that would start a run.
    fn ensure_idle(&self) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Closed);
        }
        if self.converting {
            return Err(PipelineError::Busy);
        }
        Ok(())
    }

    /// Retire every handle and mark all items for a fresh pass.
    fn begin_pass(&mut self, registry: &ArtifactRegistry) -> (u64, Vec<Job>) {
        registry.retire_all(self.items.iter().map(|i| i.id));
        for item in &mut self.items {
            item.clear_artifact();
        }
        self.converting = true;
        self.aggregate = 0;
        let jobs = self
            .items
            .iter()
            .map(|i| Job {
                id: i.id,
                source: i.source.clone(),
            })
            .collect();
        (self.generation, jobs)
    }
}

/// State shared with the per-run observer.
struct Shared {
    state: Mutex<PipelineState>,
    registry: ArtifactRegistry,
    subscribers: Mutex<Vec<UnboundedSender<Notification>>>,
}

impl Shared {
    fn notify(&self, notification: Notification) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

/// Feeds one run's progress back into the shared state.
struct RunObserver {
    shared: Arc<Shared>,
    generation: u64,
}

impl RunObserver {
    fn name_of(&self, id: ItemId) -> Option<String> {
        let state = self.shared.state.lock();
        if state.generation != self.generation {
            return None;
        }
        state
            .items
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.display_name.clone())
    }
}

impl BatchObserver for RunObserver {
    fn on_progress(&self, id: ItemId, progress: u8, aggregate: u8) {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.aggregate = aggregate.min(99);
        if let Some(item) = state.item_mut(id).filter(|i| i.handle.is_none()) {
            item.progress = progress.min(99);
        }
    }

    fn on_completed(&self, id: ItemId, artifact: &Artifact) {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return;
        }
        if let Some(item) = state.item_mut(id) {
            let handle = self.shared.registry.publish(id, artifact.clone());
            item.handle = Some(handle);
            item.artifact_len = Some(artifact.len());
            item.progress = 100;
        }
    }

    fn on_event(&self, event: SchedulerEvent) {
        let notification = match event {
            SchedulerEvent::StallRetry { id, attempt } => self
                .name_of(id)
                .map(|name| Notification::StallRetry { id, name, attempt }),
            SchedulerEvent::StallRetryExhausted { id } => self
                .name_of(id)
                .map(|name| Notification::StallRetryExhausted { id, name }),
            SchedulerEvent::ItemFailed { id, reason } => self
                .name_of(id)
                .map(|name| Notification::ItemFailed { id, name, reason }),
        };
        if let Some(notification) = notification {
            self.shared.notify(notification);
        }
    }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    scheduler: BatchScheduler,
    preferences: Arc<dyn Preferences>,
    max_files: usize,
}

impl Pipeline {
    /// Build a pipeline, restoring the last format and qualities from
    /// `preferences` and falling back to the config defaults.
    pub fn new(
        config: &PipelineConfig,
        transcoder: Arc<dyn Transcode>,
        preferences: Arc<dyn Preferences>,
    ) -> Result<Self, PipelineError> {
        let stored = preferences.load()?;
        Ok(Self::assemble(config, transcoder, preferences, &stored))
    }

    /// Stock config, preferences kept in memory.
    pub fn with_defaults(transcoder: Arc<dyn Transcode>) -> Self {
        Self::assemble(
            &PipelineConfig::default(),
            transcoder,
            Arc::new(MemoryPreferences::new()),
            &StoredPreferences::default(),
        )
    }

    fn assemble(
        config: &PipelineConfig,
        transcoder: Arc<dyn Transcode>,
        preferences: Arc<dyn Preferences>,
        stored: &StoredPreferences,
    ) -> Self {
        let quality = |format| {
            stored
                .quality_for(format)
                .unwrap_or_else(|| config.default_quality(format))
        };
        let state = PipelineState {
            items: Vec::new(),
            format: stored.format.unwrap_or(config.defaults.format),
            jpeg_quality: quality(OutputFormat::Jpeg),
            webp_quality: quality(OutputFormat::Webp),
            converting: false,
            aggregate: 0,
            generation: 0,
            closed: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                registry: ArtifactRegistry::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
            scheduler: BatchScheduler::new(transcoder, config.scheduler_config()),
            preferences,
            max_files: config.batch.max_files,
        }
    }

    /// Run `hook` between chunks to give memory back.
    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.scheduler = self.scheduler.with_reclaim_hook(hook);
        self
    }

    /// A new receiver for every notification from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<Notification> {
        let (tx, rx) = unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// Add files to the batch and convert them to the current target.
    ///
    /// Files beyond the remaining capacity are left out and counted in
    /// [`SubmitReport::excluded`]. With no capacity left at all the call
    /// fails with [`PipelineError::OverCapacity`].
    pub async fn submit_files(
        &self,
        files: Vec<SourceItem>,
    ) -> Result<SubmitReport, PipelineError> {
        let (generation, jobs, excluded) = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            if files.is_empty() {
                return Ok(SubmitReport {
                    accepted: Vec::new(),
                    excluded: 0,
                    run: None,
                });
            }

            let remaining = self.max_files.saturating_sub(state.items.len());
            if remaining == 0 {
                return Err(PipelineError::OverCapacity {
                    limit: self.max_files,
                });
            }
            let excluded = files.len().saturating_sub(remaining);
            let format = state.format;
            let mut jobs = Vec::new();
            for source in files.into_iter().take(remaining) {
                let id = ItemId::new();
                let is_heif = imaging::detect(&source.bytes).is_expected_container;
                state.items.push(ItemState {
                    id,
                    display_name: naming::display_name(&source.name, format),
                    source: source.clone(),
                    is_heif,
                    handle: None,
                    artifact_len: None,
                    progress: 0,
                });
                jobs.push(Job { id, source });
            }
            state.converting = true;
            state.aggregate = 0;
            (state.generation, jobs, excluded)
        };

        let accepted: Vec<ItemId> = jobs.iter().map(|j| j.id).collect();
        info!(accepted = accepted.len(), excluded, "batch accepted");
        self.shared.notify(Notification::BatchAccepted {
            accepted: accepted.len(),
            excluded,
            limit: self.max_files,
        });

        let run = self.run_pass(ConversionTrigger::Submit, generation, jobs).await;
        Ok(SubmitReport {
            accepted,
            excluded,
            run: Some(run),
        })
    }

    /// Switch the output format and reconvert the batch.
    ///
    /// Returns `Ok(None)` when nothing needed converting: the format was
    /// already current, or the batch is empty.
    pub async fn set_format(
        &self,
        format: OutputFormat,
    ) -> Result<Option<RunSummary>, PipelineError> {
        let (stored, pass) = {
            let mut state = self.shared.state.lock();
            state.ensure_idle()?;
            if state.format == format {
                return Ok(None);
            }
            let previous = state.format;
            state.format = format;
            for item in &mut state.items {
                item.display_name = naming::retarget(&item.display_name, previous, format);
            }
            info!(from = %previous, to = %format, "format changed");

            let pass = if state.items.is_empty() {
                None
            } else {
                Some(state.begin_pass(&self.shared.registry))
            };
            (state.stored(), pass)
        };
        self.save_preferences(stored).await;

        match pass {
            Some((generation, jobs)) => Ok(Some(
                self.run_pass(ConversionTrigger::Format, generation, jobs).await,
            )),
            None => Ok(None),
        }
    }

    /// Change the quality of the current lossy format and reconvert.
    pub async fn set_quality(&self, quality: f32) -> Result<Option<RunSummary>, PipelineError> {
        let quality = Quality::new(quality)?;
        let (stored, pass) = {
            let mut state = self.shared.state.lock();
            if !state.format.is_lossy() {
                return Err(PipelineError::FixedQuality);
            }
            state.ensure_idle()?;
            if state.quality() == quality {
                return Ok(None);
            }
            match state.format {
                OutputFormat::Jpeg => state.jpeg_quality = quality,
                OutputFormat::Webp => state.webp_quality = quality,
                OutputFormat::Png => return Err(PipelineError::FixedQuality),
            }
            info!(format = %state.format, quality = quality.value(), "quality changed");

            let pass = if state.items.is_empty() {
                None
            } else {
                Some(state.begin_pass(&self.shared.registry))
            };
            (state.stored(), pass)
        };
        self.save_preferences(stored).await;

        match pass {
            Some((generation, jobs)) => Ok(Some(
                self.run_pass(ConversionTrigger::Quality, generation, jobs).await,
            )),
            None => Ok(None),
        }
    }

    /// Give an item a new display name. Returns the name actually applied.
    pub fn rename(&self, id: ItemId, proposed: &str) -> Result<String, PipelineError> {
        let mut state = self.shared.state.lock();
        let format = state.format;
        let item = state.item_mut(id).ok_or(PipelineError::UnknownItem(id))?;
        item.display_name = naming::validate_file_name(proposed, format);
        Ok(item.display_name.clone())
    }

    /// Drop one item and its preview handle.
    pub fn remove(&self, id: ItemId) -> Result<(), PipelineError> {
        let mut state = self.shared.state.lock();
        let index = state
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or(PipelineError::UnknownItem(id))?;
        state.items.remove(index);
        self.shared.registry.retire(id);
        Ok(())
    }

    /// Drop every item. A run in flight finishes unobserved.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        let retired = self
            .shared
            .registry
            .retire_all(state.items.iter().map(|i| i.id));
        let dropped = state.items.len();
        state.items.clear();
        state.generation += 1;
        state.converting = false;
        state.aggregate = 0;
        info!(items = dropped, handles = retired, "batch reset");
    }

    /// Reset and refuse further work. Every handle is released.
    pub fn close(&self) {
        self.reset();
        self.shared.state.lock().closed = true;
        self.shared.registry.retire_everything();
        self.shared.subscribers.lock().clear();
    }

    pub fn is_converting(&self) -> bool {
        self.shared.state.lock().converting
    }

    pub fn target(&self) -> ConversionTarget {
        self.shared.state.lock().target()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.shared.state.lock();
        let items: Vec<ItemView> = state.items.iter().map(ItemState::view).collect();
        let completed_count = items.iter().filter(|i| i.has_artifact).count();
        BatchSnapshot {
            total_count: items.len(),
            completed_count,
            format: state.format,
            quality: state.quality().value(),
            is_converting: state.converting,
            aggregate_progress: state.aggregate,
            items,
        }
    }

    /// `(file name, artifact)` for every item that has one, in batch order.
    pub fn downloads(&self) -> Vec<(String, Artifact)> {
        let state = self.shared.state.lock();
        state
            .items
            .iter()
            .filter_map(|item| {
                let handle = item.handle.as_ref()?;
                let artifact = self.shared.registry.resolve(handle)?;
                Some((item.display_name.clone(), artifact))
            })
            .collect()
    }

    /// The artifact behind a preview handle, while it is live.
    pub fn preview(&self, handle: &PreviewHandle) -> Option<Artifact> {
        self.shared.registry.resolve(handle)
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }

    /// Persist on the blocking pool, outside the state lock. Failures are
    /// logged and do not stop the conversion.
    async fn save_preferences(&self, prefs: StoredPreferences) {
        let preferences = Arc::clone(&self.preferences);
        match tokio::task::spawn_blocking(move || preferences.save(&prefs)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "could not save preferences"),
            Err(e) => warn!(error = %e, "preferences writer panicked"),
        }
    }

    /// Convert `jobs`, publish as items complete, then settle the batch.
    async fn run_pass(
        &self,
        trigger: ConversionTrigger,
        generation: u64,
        jobs: Vec<Job>,
    ) -> RunSummary {
        let (target, includes_non_heic) = {
            let state = self.shared.state.lock();
            let non_heic = state
                .items
                .iter()
                .filter(|i| jobs.iter().any(|j| j.id == i.id))
                .any(|i| !i.is_heif);
            (state.target(), non_heic)
        };
        self.shared.notify(Notification::ConversionStarted {
            trigger,
            count: jobs.len(),
        });

        let observer = Arc::new(RunObserver {
            shared: Arc::clone(&self.shared),
            generation,
        });
        let outcome = self.scheduler.run(jobs, target, observer).await;

        let mut summary = RunSummary {
            trigger,
            target,
            succeeded: outcome.completed.len(),
            failed: outcome.failed,
            discarded: false,
        };

        {
            let mut state = self.shared.state.lock();
            if state.generation != generation {
                info!(?trigger, "batch was reset during the run, discarding results");
                summary.discarded = true;
                return summary;
            }
            let failed_ids: Vec<ItemId> = summary.failed.iter().map(|f| f.id).collect();
            state.items.retain(|i| !failed_ids.contains(&i.id));
            self.shared.registry.retire_all(failed_ids);
            state.converting = false;
            state.aggregate = if state.items.is_empty() { 0 } else { 100 };
        }

        info!(
            ?trigger,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "conversion finished"
        );
        self.shared.notify(Notification::ConversionComplete {
            trigger,
            target,
            succeeded: summary.succeeded,
            failed: summary.failed.len(),
            includes_non_heic,
        });
        summary
    }
}
