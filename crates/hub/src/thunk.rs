// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The thunk graph: lifecycles, parent/child trees, and the drain
//! bookkeeping that decides when a tree is fully complete.
//!
//! A thunk is *fully complete* once its phase is terminal, it has no
//! pending actions, no state update it caused is still awaiting
//! acknowledgement, and every child has already been removed. Removal is
//! strictly post-order over the tree; the root's removal is what releases
//! the scheduler lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::{debug, info, warn};

use statemux_wire::action::{ActionId, ThunkId, UpdateId, ViewId};
use statemux_wire::envelope::{ThunkPhase, ThunkSummary};
use statemux_wire::error::{EngineError, Result};

/// Where a thunk was registered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkSource {
    View,
    Authoritative,
}

/// Registration request for a new thunk.
#[derive(Debug, Clone)]
pub struct ThunkSpec {
    pub id: ThunkId,
    pub source_view_id: ViewId,
    pub parent_id: Option<ThunkId>,
    pub source: ThunkSource,
    pub bypass_thunk_lock: bool,
    pub bypass_access_control: bool,
}

/// One state update caused by a thunk action, awaiting acknowledgement.
#[derive(Debug)]
struct UpdateRecord {
    expected: IndexSet<ViewId>,
    created_at: Instant,
}

/// A registered thunk.
#[derive(Debug)]
pub struct ThunkRecord {
    pub id: ThunkId,
    pub source_view_id: ViewId,
    pub parent_id: Option<ThunkId>,
    pub source: ThunkSource,
    pub phase: ThunkPhase,
    pub bypass_thunk_lock: bool,
    pub bypass_access_control: bool,
    /// The transitive parent root; a thunk without a parent is its own root.
    pub root_id: ThunkId,
    children: IndexSet<ThunkId>,
    pending_actions: IndexSet<ActionId>,
    pending_updates: IndexMap<UpdateId, UpdateRecord>,
    pub result: Option<Value>,
    pub error: Option<EngineError>,
    deadline: Instant,
    fully_complete: bool,
}

impl ThunkRecord {
    pub fn summary(&self) -> ThunkSummary {
        ThunkSummary {
            id: self.id,
            source_view_id: self.source_view_id,
            parent_id: self.parent_id,
            phase: self.phase,
        }
    }

    pub fn pending_action_count(&self) -> usize {
        self.pending_actions.len()
    }

    pub fn pending_update_count(&self) -> usize {
        self.pending_updates.len()
    }
}

/// Lifecycle events, drained by the hub loop after every mutation so the
/// scheduler observes them before its next scan.
#[derive(Debug)]
pub enum ThunkEvent {
    Started { thunk_id: ThunkId },
    Completed { thunk_id: ThunkId },
    Failed { thunk_id: ThunkId },
    /// The whole subtree under this thunk has drained; the hub should
    /// notify the registerer and then remove the record.
    FullyComplete {
        thunk_id: ThunkId,
        source: ThunkSource,
        source_view_id: ViewId,
        result: Option<Value>,
        error: Option<EngineError>,
    },
    /// A root record was removed — the scheduler lock (if held by it) is
    /// released and the queue re-scanned.
    RootCompleted { root_id: ThunkId },
}

/// Owns the thunk graph and drives the completion signals.
pub struct ThunkManager {
    thunks: IndexMap<ThunkId, ThunkRecord>,
    update_index: HashMap<UpdateId, ThunkId>,
    events: VecDeque<ThunkEvent>,
    capacity: usize,
    completion_timeout: Duration,
}

impl ThunkManager {
    pub fn new(capacity: usize, completion_timeout: Duration) -> Self {
        Self {
            thunks: IndexMap::new(),
            update_index: HashMap::new(),
            events: VecDeque::new(),
            capacity,
            completion_timeout,
        }
    }

    pub fn contains(&self, thunk_id: ThunkId) -> bool {
        self.thunks.contains_key(&thunk_id)
    }

    pub fn get(&self, thunk_id: ThunkId) -> Option<&ThunkRecord> {
        self.thunks.get(&thunk_id)
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    /// Resolve a thunk to the root of its tree.
    pub fn resolve_root(&self, thunk_id: ThunkId) -> Option<ThunkId> {
        self.thunks.get(&thunk_id).map(|t| t.root_id)
    }

    /// Register a new thunk. Refused when the registry is at capacity or
    /// the named parent is gone or already terminal; a refused thunk goes
    /// straight from pending to failed and is never stored.
    pub fn register(&mut self, spec: ThunkSpec) -> Result<()> {
        if self.thunks.len() >= self.capacity {
            return Err(EngineError::resource("thunk registry overflow").with_thunk(spec.id));
        }
        if self.thunks.contains_key(&spec.id) {
            return Err(EngineError::thunk("thunk already registered").with_thunk(spec.id));
        }
        let root_id = match spec.parent_id {
            Some(parent_id) => {
                let parent = self.thunks.get(&parent_id).ok_or_else(|| {
                    EngineError::thunk("parent thunk is not active").with_thunk(spec.id)
                })?;
                if parent.phase.is_terminal() {
                    return Err(EngineError::thunk("parent thunk already settled")
                        .with_thunk(spec.id));
                }
                parent.root_id
            }
            None => spec.id,
        };

        let record = ThunkRecord {
            id: spec.id,
            source_view_id: spec.source_view_id,
            parent_id: spec.parent_id,
            source: spec.source,
            phase: ThunkPhase::Executing,
            bypass_thunk_lock: spec.bypass_thunk_lock,
            bypass_access_control: spec.bypass_access_control,
            root_id,
            children: IndexSet::new(),
            pending_actions: IndexSet::new(),
            pending_updates: IndexMap::new(),
            result: None,
            error: None,
            deadline: Instant::now() + self.completion_timeout,
            fully_complete: false,
        };
        if let Some(parent_id) = spec.parent_id {
            if let Some(parent) = self.thunks.get_mut(&parent_id) {
                parent.children.insert(spec.id);
            }
        }
        info!(thunk = %spec.id, root = %root_id, view = spec.source_view_id, "thunk registered");
        self.thunks.insert(spec.id, record);
        self.events.push_back(ThunkEvent::Started { thunk_id: spec.id });
        Ok(())
    }

    /// Record an action dispatched on behalf of a thunk. Dispatching after
    /// the thunk has settled is a protocol error.
    pub fn record_action(&mut self, thunk_id: ThunkId, action_id: ActionId) -> Result<()> {
        let record = self
            .thunks
            .get_mut(&thunk_id)
            .ok_or_else(|| EngineError::thunk("unknown thunk").with_thunk(thunk_id))?;
        if record.phase.is_terminal() {
            return Err(EngineError::thunk("thunk dispatched after completion")
                .with_thunk(thunk_id)
                .with_action(action_id));
        }
        record.pending_actions.insert(action_id);
        Ok(())
    }

    /// Remove an action from the thunk's pending set (it executed, or its
    /// enqueue was rolled back).
    pub fn complete_action(&mut self, thunk_id: ThunkId, action_id: ActionId) {
        if let Some(record) = self.thunks.get_mut(&thunk_id) {
            record.pending_actions.shift_remove(&action_id);
            self.evaluate(thunk_id);
        }
    }

    /// Track a state update caused by a thunk action.
    pub fn track_update(
        &mut self,
        thunk_id: ThunkId,
        update_id: UpdateId,
        expected: IndexSet<ViewId>,
    ) {
        if expected.is_empty() {
            return;
        }
        let Some(record) = self.thunks.get_mut(&thunk_id) else {
            return;
        };
        record
            .pending_updates
            .insert(update_id, UpdateRecord { expected, created_at: Instant::now() });
        self.update_index.insert(update_id, thunk_id);
    }

    /// One view acknowledged one update. Returns `true` when the update
    /// record fully drained.
    pub fn acknowledge_update(&mut self, update_id: UpdateId, view_id: ViewId) -> bool {
        let Some(&thunk_id) = self.update_index.get(&update_id) else {
            debug!(update = %update_id, view_id, "ack for an unknown update");
            return false;
        };
        let Some(record) = self.thunks.get_mut(&thunk_id) else {
            self.update_index.remove(&update_id);
            return false;
        };
        let drained = match record.pending_updates.get_mut(&update_id) {
            Some(update) => {
                update.expected.shift_remove(&view_id);
                update.expected.is_empty()
            }
            None => false,
        };
        if drained {
            record.pending_updates.shift_remove(&update_id);
            self.update_index.remove(&update_id);
            self.evaluate(thunk_id);
        }
        drained
    }

    /// User code reported success.
    pub fn complete(&mut self, thunk_id: ThunkId, result: Option<Value>) -> Result<()> {
        self.settle(thunk_id, ThunkPhase::Completed, result, None)
    }

    /// User code reported failure (or the engine failed the thunk).
    pub fn fail(&mut self, thunk_id: ThunkId, error: EngineError) -> Result<()> {
        self.settle(thunk_id, ThunkPhase::Failed, None, Some(error))
    }

    fn settle(
        &mut self,
        thunk_id: ThunkId,
        phase: ThunkPhase,
        result: Option<Value>,
        error: Option<EngineError>,
    ) -> Result<()> {
        let record = self
            .thunks
            .get_mut(&thunk_id)
            .ok_or_else(|| EngineError::thunk("unknown thunk").with_thunk(thunk_id))?;
        if record.phase.is_terminal() {
            return Err(EngineError::thunk("thunk already settled").with_thunk(thunk_id));
        }
        record.phase = phase;
        record.result = result;
        record.error = error;
        self.events.push_back(match phase {
            ThunkPhase::Failed => ThunkEvent::Failed { thunk_id },
            _ => ThunkEvent::Completed { thunk_id },
        });
        self.evaluate(thunk_id);
        Ok(())
    }

    /// A view went away: treat it as having acknowledged every update it
    /// owed, and fail its in-flight thunks.
    pub fn cleanup_dead_view(&mut self, view_id: ViewId) {
        let mut affected = Vec::new();
        let update_index = &mut self.update_index;
        for (id, record) in &mut self.thunks {
            let before = record.pending_updates.len();
            record.pending_updates.retain(|update_id, update| {
                update.expected.shift_remove(&view_id);
                if update.expected.is_empty() {
                    update_index.remove(update_id);
                    false
                } else {
                    true
                }
            });
            if record.pending_updates.len() != before {
                affected.push(*id);
            }
        }

        let orphaned: Vec<ThunkId> = self
            .thunks
            .values()
            .filter(|t| t.source_view_id == view_id && !t.phase.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in orphaned {
            warn!(thunk = %id, view_id, "failing thunk of a disconnected view");
            let _ = self.fail(
                id,
                EngineError::ipc("source view disconnected").with_thunk(id).with_view(view_id),
            );
        }

        for id in affected {
            self.evaluate(id);
        }
    }

    /// Drop update records older than the bound.
    pub fn sweep_expired_updates(&mut self, max_age: Duration) {
        let now = Instant::now();
        let mut affected = Vec::new();
        let update_index = &mut self.update_index;
        for (id, record) in &mut self.thunks {
            let before = record.pending_updates.len();
            record.pending_updates.retain(|update_id, update| {
                if now.duration_since(update.created_at) > max_age {
                    warn!(update = %update_id, thunk = %id, "dropping expired state update");
                    update_index.remove(update_id);
                    false
                } else {
                    true
                }
            });
            if record.pending_updates.len() != before {
                affected.push(*id);
            }
        }
        for id in affected {
            self.evaluate(id);
        }
    }

    /// Fail executing thunks whose completion deadline has passed.
    pub fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let overdue: Vec<ThunkId> = self
            .thunks
            .values()
            .filter(|t| !t.phase.is_terminal() && now >= t.deadline)
            .map(|t| t.id)
            .collect();
        for id in overdue {
            warn!(thunk = %id, "thunk completion deadline exceeded");
            let _ = self.fail(id, EngineError::thunk("thunk timed out").with_thunk(id));
        }
    }

    /// Check one thunk for fully-complete, emitting the event at most once.
    fn evaluate(&mut self, thunk_id: ThunkId) {
        let Some(record) = self.thunks.get_mut(&thunk_id) else {
            return;
        };
        if record.fully_complete
            || !record.phase.is_terminal()
            || !record.pending_actions.is_empty()
            || !record.pending_updates.is_empty()
            || !record.children.is_empty()
        {
            return;
        }
        record.fully_complete = true;
        debug!(thunk = %thunk_id, "thunk fully complete");
        self.events.push_back(ThunkEvent::FullyComplete {
            thunk_id,
            source: record.source,
            source_view_id: record.source_view_id,
            result: record.result.clone(),
            error: record.error.clone(),
        });
    }

    /// Remove a fully complete record. Detaches it from its parent (which
    /// may itself become fully complete) or, for a root, announces
    /// root-completion so the scheduler releases the lock.
    pub fn remove(&mut self, thunk_id: ThunkId) {
        let Some(record) = self.thunks.shift_remove(&thunk_id) else {
            return;
        };
        if !record.children.is_empty() {
            warn!(thunk = %thunk_id, "removed a thunk that still had children");
        }
        for update_id in record.pending_updates.keys() {
            self.update_index.remove(update_id);
        }
        match record.parent_id {
            Some(parent_id) => {
                if let Some(parent) = self.thunks.get_mut(&parent_id) {
                    parent.children.shift_remove(&thunk_id);
                }
                self.evaluate(parent_id);
            }
            None => {
                info!(root = %thunk_id, "thunk tree complete");
                self.events.push_back(ThunkEvent::RootCompleted { root_id: thunk_id });
            }
        }
    }

    /// Drain pending lifecycle events in emission order.
    pub fn drain_events(&mut self) -> Vec<ThunkEvent> {
        self.events.drain(..).collect()
    }

    /// Compact snapshot of every active thunk, for broadcast and admin
    /// queries.
    pub fn summaries(&self) -> Vec<ThunkSummary> {
        self.thunks.values().map(ThunkRecord::summary).collect()
    }
}

#[cfg(test)]
#[path = "thunk_tests.rs"]
mod tests;
