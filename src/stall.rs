//! Stall detection for a single transcode attempt.
//!
//! An attempt is given [`StallPolicy::timeout`]. If by then its progress has
//! not reached [`StallPolicy::threshold`] the attempt is abandoned: its
//! reporter is detached and the outcome is [`AttemptOutcome::Stalled`].
//! Attempts at or beyond the threshold are left to finish.
//!
//! ```text
//! Pending → Running ─┬─ Completed
//!                    ├─ Failed
//!                    └─ Stalled → Retrying → { Completed | Failed }
//! ```
//!
//! Retrying is the scheduler's business; this module only runs one attempt.
//! Abandoned work is not preempted (blocking decodes cannot be interrupted);
//! its late progress and result are simply dropped.

use crate::transcode::{ConversionError, ProgressReporter};
use crate::types::Artifact;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default time an attempt gets before it is considered stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(20);
/// Default near-complete progress that exempts an attempt from the deadline.
pub const DEFAULT_STALL_THRESHOLD: u8 = 90;

/// Result of one guarded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed(Artifact),
    Failed(ConversionError),
    Stalled,
}

impl From<Result<Artifact, ConversionError>> for AttemptOutcome {
    fn from(result: Result<Artifact, ConversionError>) -> Self {
        match result {
            Ok(artifact) => AttemptOutcome::Completed(artifact),
            Err(err) => AttemptOutcome::Failed(err),
        }
    }
}

/// Per-item lifecycle as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Running,
    Stalled,
    Retrying,
    Completed,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::Failed)
    }

    /// Next state after an attempt settles. `retries_left` is how many fresh
    /// attempts the item may still get.
    pub fn settle(self, outcome: &AttemptOutcome, retries_left: u32) -> AttemptState {
        match outcome {
            AttemptOutcome::Completed(_) => AttemptState::Completed,
            AttemptOutcome::Failed(_) => AttemptState::Failed,
            AttemptOutcome::Stalled if retries_left > 0 => AttemptState::Stalled,
            AttemptOutcome::Stalled => AttemptState::Failed,
        }
    }
}

/// Deadline and threshold applied to each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    pub timeout: Duration,
    pub threshold: u8,
    /// Fresh attempts granted after a stall.
    pub retries: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STALL_TIMEOUT,
            threshold: DEFAULT_STALL_THRESHOLD,
            retries: 1,
        }
    }
}

impl StallPolicy {
    /// Drive `attempt` under the deadline.
    pub async fn guard<F>(&self, attempt: F, progress: &ProgressReporter) -> AttemptOutcome
    where
        F: Future<Output = Result<Artifact, ConversionError>>,
    {
        tokio::pin!(attempt);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        tokio::select! {
            result = &mut attempt => return result.into(),
            _ = &mut deadline => {}
        }

        let reached = progress.current();
        if reached >= self.threshold {
            debug!(progress = reached, "past deadline but near complete, waiting");
            return attempt.await.into();
        }

        debug!(progress = reached, timeout = ?self.timeout, "attempt stalled");
        progress.detach();
        AttemptOutcome::Stalled
    }
}
