// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outstanding dispatches awaiting acknowledgement.
//!
//! One entry per in-flight action, keyed by action id. Entries leave the
//! registry exactly once: on acknowledgement, on deadline expiry, or on
//! connection teardown.

use indexmap::IndexMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use statemux_wire::action::ActionId;
use statemux_wire::error::{EngineError, Result};

struct PendingEntry {
    reply: oneshot::Sender<Result<u64>>,
    deadline: Instant,
}

/// Per-view registry of unacknowledged dispatches.
pub struct PendingActions {
    entries: IndexMap<ActionId, PendingEntry>,
    capacity: usize,
}

impl PendingActions {
    pub fn new(capacity: usize) -> Self {
        Self { entries: IndexMap::new(), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Register one in-flight dispatch. The registry is bounded; a full
    /// registry refuses the newcomer, handing the reply back so the
    /// caller can reject through it.
    #[allow(clippy::type_complexity)]
    pub fn register(
        &mut self,
        action_id: ActionId,
        reply: oneshot::Sender<Result<u64>>,
        deadline: Instant,
    ) -> std::result::Result<(), (oneshot::Sender<Result<u64>>, EngineError)> {
        if self.is_full() {
            let error = EngineError::resource(format!(
                "pending-action registry saturated (capacity {})",
                self.capacity
            ))
            .with_action(action_id);
            return Err((reply, error));
        }
        self.entries.insert(action_id, PendingEntry { reply, deadline });
        Ok(())
    }

    /// Resolve one entry with the acknowledgement outcome. Returns false
    /// for an unknown id (already timed out or never registered).
    pub fn resolve(&mut self, action_id: ActionId, outcome: Result<u64>) -> bool {
        match self.entries.shift_remove(&action_id) {
            Some(entry) => {
                let _ = entry.reply.send(outcome);
                true
            }
            None => {
                debug!(action = %action_id, "ack for an unknown action");
                false
            }
        }
    }

    /// The earliest deadline among the outstanding entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Reject every entry whose deadline has passed. Returns how many
    /// were expired.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<ActionId> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.deadline)
            .map(|(id, _)| *id)
            .collect();
        for action_id in &expired {
            warn!(action = %action_id, "dispatch acknowledgement timed out");
            if let Some(entry) = self.entries.shift_remove(action_id) {
                let _ = entry.reply.send(Err(EngineError::ipc(
                    "dispatch acknowledgement timed out",
                )
                .with_action(*action_id)));
            }
        }
        expired.len()
    }

    /// Reject everything (connection teardown).
    pub fn reject_all(&mut self, error: &EngineError) {
        for (action_id, entry) in self.entries.drain(..) {
            let _ = entry.reply.send(Err(error.clone().with_action(action_id)));
        }
    }
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;
