//! Batch scheduling: bounded chunks, aggregate progress, isolated failures.
//!
//! ```text
//! jobs ─► chunk 1 [a b] ──settle all──► pause + reclaim ─► chunk 2 [c d] ─► ... ─► BatchOutcome
//!              │ │
//!              ▼ ▼  (polled concurrently, each under the StallPolicy)
//!           transcode
//! ```
//!
//! Items inside a chunk run concurrently on the scheduler's task; chunk N+1
//! starts only after every item of chunk N has settled. Decoded bitmaps are
//! large, so the chunk size is what bounds peak memory.
//!
//! A failing item never aborts its siblings. `run` itself cannot fail: every
//! per-item error ends up in [`BatchOutcome::failed`].

use crate::stall::{AttemptOutcome, AttemptState, StallPolicy};
use crate::transcode::{ConversionError, ProgressReporter, Transcode};
use crate::types::{Artifact, ConversionTarget, ItemId, SourceItem};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of items transcoded at once.
pub const DEFAULT_CHUNK_SIZE: usize = 2;
/// Default pause between chunks.
pub const DEFAULT_CHUNK_PAUSE: Duration = Duration::from_millis(100);

/// Called between chunks so the host can release memory if it can.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// One item to convert.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: ItemId,
    pub source: SourceItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub id: ItemId,
    pub name: String,
    pub reason: ConversionError,
}

/// Everything a run produced, successes and failures alike.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub completed: Vec<(ItemId, Artifact)>,
    pub failed: Vec<FailedItem>,
}

/// Noteworthy moments of a run other than plain progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A stalled item is being retried; `attempt` is the upcoming attempt number.
    StallRetry { id: ItemId, attempt: u32 },
    /// A retried item stalled again and will not be retried further.
    StallRetryExhausted { id: ItemId },
    ItemFailed { id: ItemId, reason: ConversionError },
}

/// Receives per-item updates while a run is in flight.
pub trait BatchObserver: Send + Sync {
    /// `progress` is the item's value, `aggregate` the whole batch's (0–100).
    fn on_progress(&self, id: ItemId, progress: u8, aggregate: u8);

    fn on_completed(&self, _id: ItemId, _artifact: &Artifact) {}

    fn on_event(&self, _event: SchedulerEvent) {}
}

/// Observer that ignores everything.
pub struct NullObserver;

impl BatchObserver for NullObserver {
    fn on_progress(&self, _id: ItemId, _progress: u8, _aggregate: u8) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    pub stall: StallPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pause: DEFAULT_CHUNK_PAUSE,
            stall: StallPolicy::default(),
        }
    }
}

/// Per-item progress of the current run; aggregate is their mean.
struct ProgressTable {
    values: Mutex<Vec<u8>>,
}

impl ProgressTable {
    fn new(len: usize) -> Self {
        Self {
            values: Mutex::new(vec![0; len]),
        }
    }

    /// Zero an item for a new attempt. `notify` runs under the table lock.
    fn restart(&self, index: usize, notify: impl FnOnce(u8, u8)) {
        let mut values = self.values.lock();
        values[index] = 0;
        notify(0, aggregate(&values));
    }

    /// Raise an item's progress. Reports from worker threads may arrive out
    /// of order, so the stored value only grows, and `notify` runs under the
    /// table lock to hand aggregates to the observer in the order computed.
    fn advance(&self, index: usize, progress: u8, notify: impl FnOnce(u8, u8)) {
        let mut values = self.values.lock();
        values[index] = values[index].max(progress.min(100));
        notify(values[index], aggregate(&values));
    }
}

/// sum(progress) / (count × 100), as a 0–100 integer.
pub fn aggregate(values: &[u8]) -> u8 {
    if values.is_empty() {
        return 0;
    }
    let sum: u64 = values.iter().map(|&v| u64::from(v)).sum();
    (sum / values.len() as u64) as u8
}

pub struct BatchScheduler {
    transcoder: Arc<dyn Transcode>,
    config: SchedulerConfig,
    reclaim: Option<ReclaimHook>,
}

impl BatchScheduler {
    pub fn new(transcoder: Arc<dyn Transcode>, config: SchedulerConfig) -> Self {
        Self {
            transcoder,
            config,
            reclaim: None,
        }
    }

    pub fn with_reclaim_hook(mut self, hook: ReclaimHook) -> Self {
        self.reclaim = Some(hook);
        self
    }

    /// Convert every job to `target`, chunk by chunk.
    pub async fn run(
        &self,
        jobs: Vec<Job>,
        target: ConversionTarget,
        observer: Arc<dyn BatchObserver>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if jobs.is_empty() {
            return outcome;
        }

        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = jobs.len().div_ceil(chunk_size);
        let table = Arc::new(ProgressTable::new(jobs.len()));
        info!(
            items = jobs.len(),
            chunks = chunk_count,
            format = %target.format(),
            quality = target.quality().value(),
            "starting batch"
        );

        for (chunk_index, chunk) in jobs.chunks(chunk_size).enumerate() {
            let base = chunk_index * chunk_size;
            let settled = join_all(chunk.iter().enumerate().map(|(offset, job)| {
                self.run_item(base + offset, job, target, &table, &observer)
            }))
            .await;

            for (job, result) in chunk.iter().zip(settled) {
                match result {
                    Ok(artifact) => outcome.completed.push((job.id, artifact)),
                    Err(reason) => outcome.failed.push(FailedItem {
                        id: job.id,
                        name: job.source.name.clone(),
                        reason,
                    }),
                }
            }

            if chunk_index + 1 < chunk_count {
                debug!(chunk = chunk_index + 1, of = chunk_count, "chunk settled");
                tokio::task::yield_now().await;
                if !self.config.chunk_pause.is_zero() {
                    tokio::time::sleep(self.config.chunk_pause).await;
                }
                if let Some(reclaim) = &self.reclaim {
                    reclaim();
                }
            }
        }

        info!(
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "batch finished"
        );
        outcome
    }

    /// Run one item to a terminal state, retrying stalls per the policy.
    async fn run_item(
        &self,
        index: usize,
        job: &Job,
        target: ConversionTarget,
        table: &Arc<ProgressTable>,
        observer: &Arc<dyn BatchObserver>,
    ) -> Result<Artifact, ConversionError> {
        let policy = self.config.stall;
        let mut state = AttemptState::Pending;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            state = match state {
                AttemptState::Stalled => AttemptState::Retrying,
                _ => AttemptState::Running,
            };

            table.restart(index, |progress, aggregate| {
                observer.on_progress(job.id, progress, aggregate)
            });

            let reporter = {
                let table = Arc::clone(table);
                let observer = Arc::clone(observer);
                let id = job.id;
                ProgressReporter::new(move |progress| {
                    table.advance(index, progress, |progress, aggregate| {
                        observer.on_progress(id, progress, aggregate)
                    });
                })
            };

            let outcome = policy
                .guard(
                    self.transcoder.transcode(&job.source, target, &reporter),
                    &reporter,
                )
                .await;
            let retries_left = policy.retries.saturating_sub(attempt - 1);
            state = state.settle(&outcome, retries_left);

            match outcome {
                AttemptOutcome::Completed(artifact) => {
                    observer.on_completed(job.id, &artifact);
                    return Ok(artifact);
                }
                AttemptOutcome::Failed(reason) => {
                    warn!(item = %job.id, file = %job.source.name, error = %reason, "item failed");
                    observer.on_event(SchedulerEvent::ItemFailed {
                        id: job.id,
                        reason: reason.clone(),
                    });
                    return Err(reason);
                }
                AttemptOutcome::Stalled if state == AttemptState::Stalled => {
                    warn!(item = %job.id, file = %job.source.name, attempt, "stalled, retrying");
                    observer.on_event(SchedulerEvent::StallRetry {
                        id: job.id,
                        attempt: attempt + 1,
                    });
                }
                AttemptOutcome::Stalled => {
                    warn!(item = %job.id, file = %job.source.name, attempt, "stalled, giving up");
                    let reason = ConversionError::Stalled {
                        after: policy.timeout,
                    };
                    observer.on_event(SchedulerEvent::StallRetryExhausted { id: job.id });
                    observer.on_event(SchedulerEvent::ItemFailed {
                        id: job.id,
                        reason: reason.clone(),
                    });
                    return Err(reason);
                }
            }
        }
    }
}
