// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The view's passive copy of its state slice.
//!
//! Populated exclusively by state-update messages from the hub — never by
//! dispatch directly. Carries a version watch so dispatch resolution can
//! wait until the mirror has observed the post-apply version.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::warn;

/// Read-only mirror of the authoritative state (or the subscribed slice
/// of it), plus the version of the last observed update.
#[derive(Debug)]
pub struct LocalMirror {
    state: RwLock<Value>,
    version: watch::Sender<u64>,
}

impl Default for LocalMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMirror {
    /// An empty mirror at version 0; the first state update fills it.
    pub fn new() -> Self {
        Self { state: RwLock::new(Value::Object(Map::new())), version: watch::Sender::new(0) }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Value {
        self.state.read().clone()
    }

    /// Version of the last applied update (0 before the first).
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Apply one state update. Updates arrive in hub order; a version
    /// that moves backwards is dropped.
    pub fn apply(&self, version: u64, slice: Value) {
        if version < self.version() {
            warn!(version, current = self.version(), "dropping stale state update");
            return;
        }
        *self.state.write() = slice;
        self.version.send_replace(version);
    }

    /// Wait until the mirror has observed at least the given version.
    pub async fn wait_for(&self, version: u64) {
        let mut rx = self.version.subscribe();
        loop {
            if *rx.borrow_and_update() >= version {
                return;
            }
            if rx.changed().await.is_err() {
                return; // mirror dropped mid-shutdown
            }
        }
    }
}

#[cfg(test)]
#[path = "mirror_tests.rs"]
mod tests;
