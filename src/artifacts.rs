//! Preview handles and the artifacts behind them.
//!
//! A [`PreviewHandle`] is a revocable, opaque reference a renderer can
//! resolve to an item's current [`Artifact`] without the pipeline copying the
//! bytes. The registry enforces one live handle per item:
//!
//! - [`publish`](ArtifactRegistry::publish) issues the replacement and revokes
//!   the old handle under a single lock, so nobody observes two live handles
//!   for an item or an item momentarily without one.
//! - [`retire`](ArtifactRegistry::retire) / [`retire_all`](ArtifactRegistry::retire_all)
//!   release handles when an item is removed, the batch is reset, a
//!   reconversion pass starts, or the pipeline is closed.
//!
//! Revoked handles resolve to `None`. Forgetting to retire is the leak this
//! module exists to prevent; [`RegistryStats`] makes it observable.

use crate::types::{Artifact, ItemId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

const HANDLE_SCHEME: &str = "blob:heic-batch/";

/// Opaque, revocable reference to one published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PreviewHandle(String);

impl PreviewHandle {
    fn issue() -> Self {
        Self(format!("{HANDLE_SCHEME}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle bookkeeping counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub issued: u64,
    pub revoked: u64,
    pub live: usize,
}

#[derive(Default)]
struct Inner {
    by_item: HashMap<ItemId, PreviewHandle>,
    live: HashMap<PreviewHandle, Artifact>,
    issued: u64,
    revoked: u64,
}

impl Inner {
    fn revoke(&mut self, item: ItemId) -> bool {
        match self.by_item.remove(&item) {
            Some(handle) => {
                self.live.remove(&handle);
                self.revoked += 1;
                debug!(%item, %handle, "revoked preview handle");
                true
            }
            None => false,
        }
    }
}

/// Owner of every live preview handle.
#[derive(Default)]
pub struct ArtifactRegistry {
    inner: Mutex<Inner>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `artifact` the item's current one and return its new handle.
    /// Any previous handle for the item is revoked in the same step.
    pub fn publish(&self, item: ItemId, artifact: Artifact) -> PreviewHandle {
        let handle = PreviewHandle::issue();
        let mut inner = self.inner.lock();
        inner.live.insert(handle.clone(), artifact);
        inner.issued += 1;
        inner.revoke(item);
        inner.by_item.insert(item, handle.clone());
        debug!(%item, %handle, "published preview handle");
        handle
    }

    /// Release the item's handle. Returns whether one was live.
    pub fn retire(&self, item: ItemId) -> bool {
        self.inner.lock().revoke(item)
    }

    /// Release the handles of all given items. Returns how many were live.
    pub fn retire_all(&self, items: impl IntoIterator<Item = ItemId>) -> usize {
        let mut inner = self.inner.lock();
        items.into_iter().filter(|id| inner.revoke(*id)).count()
    }

    /// Release every handle the registry knows about.
    pub fn retire_everything(&self) -> usize {
        let mut inner = self.inner.lock();
        let items: Vec<ItemId> = inner.by_item.keys().copied().collect();
        items.into_iter().filter(|id| inner.revoke(*id)).count()
    }

    /// The artifact behind a handle, or `None` once revoked.
    pub fn resolve(&self, handle: &PreviewHandle) -> Option<Artifact> {
        self.inner.lock().live.get(handle).cloned()
    }

    pub fn handle_for(&self, item: ItemId) -> Option<PreviewHandle> {
        self.inner.lock().by_item.get(&item).cloned()
    }

    /// Number of live handles belonging to `item` (never more than one).
    pub fn live_for(&self, item: ItemId) -> usize {
        let inner = self.inner.lock();
        inner
            .by_item
            .get(&item)
            .filter(|h| inner.live.contains_key(*h))
            .map_or(0, |_| 1)
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            issued: inner.issued,
            revoked: inner.revoked,
            live: inner.live.len(),
        }
    }
}
