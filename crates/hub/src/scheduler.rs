// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The central action queue and the thunk-tree exclusivity lock.
//!
//! One FIFO holds every queued action. The scheduler picks the earliest
//! runnable entry; entries that are not runnable stay put and are skipped.
//! Once an action belonging to a thunk tree runs, that tree holds the
//! lock until its root completes, and no foreign action runs in between —
//! except actions that bypass the lock and actions whose declared keys
//! provably do not overlap the tree's keys.

use std::collections::VecDeque;
use std::time::Instant;

use indexmap::IndexSet;
use tokio::sync::oneshot;
use tracing::{info, trace};

use statemux_wire::action::{Action, ThunkId, ViewId};
use statemux_wire::error::{EngineError, Result};

use crate::thunk::ThunkManager;

/// Where the outcome of a queued action is reported.
#[derive(Debug)]
pub enum Completion {
    /// Acknowledge over IPC to the dispatching view.
    View { view_id: ViewId },
    /// Resolve a local (authoritative-side) dispatch with the post-apply
    /// state version.
    Local { reply: oneshot::Sender<Result<u64>> },
}

/// One queue entry.
#[derive(Debug)]
pub struct QueuedAction {
    pub action: Action,
    pub received_at: Instant,
    pub completion: Completion,
}

/// Scheduler state, for logging and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Scanning,
    Executing,
}

/// FIFO action queue with thunk-tree exclusivity.
pub struct ActionScheduler {
    queue: VecDeque<QueuedAction>,
    capacity: usize,
    locked_root: Option<ThunkId>,
    /// Keys declared by actions of the locked tree that have already been
    /// picked, feeding the non-overlapping-keys fast path.
    tree_keys: IndexSet<String>,
    /// False once any picked tree action failed to declare keys — both
    /// sides must declare for the fast path to fire.
    tree_keys_complete: bool,
    /// Root and keys of the action currently in the executor.
    executing: Option<(Option<ThunkId>, Option<Vec<String>>)>,
    phase: SchedulerPhase,
    scanning: bool,
}

impl ActionScheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            locked_root: None,
            tree_keys: IndexSet::new(),
            tree_keys_complete: true,
            executing: None,
            phase: SchedulerPhase::Idle,
            scanning: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn locked_root(&self) -> Option<ThunkId> {
        self.locked_root
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// Append one action. A full queue rejects the newcomer, handing the
    /// entry back so the caller can report through its completion; nothing
    /// else may exceed the bound.
    pub fn enqueue(
        &mut self,
        action: Action,
        completion: Completion,
    ) -> std::result::Result<(), Box<QueuedAction>> {
        let entry = QueuedAction { action, received_at: Instant::now(), completion };
        if self.queue.len() >= self.capacity {
            return Err(Box::new(entry));
        }
        trace!(action = %entry.action.action_type, id = %entry.action.id, "action queued");
        self.queue.push_back(entry);
        Ok(())
    }

    /// The overflow error reported for a rejected enqueue.
    pub fn overflow_error(&self, action: &Action) -> EngineError {
        EngineError::resource(format!("action queue overflow (capacity {})", self.capacity))
            .with_action(action.id)
    }

    /// Guard against nested scan loops: returns false when a scan is
    /// already in progress, in which case the running loop will pick up
    /// whatever was enqueued.
    pub fn begin_scan(&mut self) -> bool {
        if self.scanning {
            return false;
        }
        self.scanning = true;
        self.phase = SchedulerPhase::Scanning;
        true
    }

    pub fn end_scan(&mut self) {
        self.scanning = false;
        self.phase = if self.executing.is_some() {
            SchedulerPhase::Executing
        } else {
            SchedulerPhase::Idle
        };
    }

    /// Pick the next runnable entry, acquiring the tree lock when the
    /// picked action belongs to an unlocked tree.
    ///
    /// Entries belonging to the locked root are preferred over older
    /// foreign entries, keeping a tree's actions contiguous; among equally
    /// eligible entries FIFO wins.
    pub fn pop_runnable(&mut self, thunks: &ThunkManager) -> Option<QueuedAction> {
        let index = self.pick_index(thunks)?;
        let entry = self.queue.remove(index)?;

        let root = entry
            .action
            .parent_thunk_id
            .and_then(|id| thunks.resolve_root(id))
            .filter(|_| !entry.action.bypass_thunk_lock);
        if let Some(root) = root {
            if self.locked_root.is_none() {
                info!(root = %root, "thunk tree acquired the scheduler lock");
                self.locked_root = Some(root);
            }
            if self.locked_root == Some(root) {
                match entry.action.keys.as_deref() {
                    Some(keys) => self.tree_keys.extend(keys.iter().cloned()),
                    None => self.tree_keys_complete = false,
                }
            }
        }

        self.executing = Some((root, entry.action.keys.clone()));
        self.phase = SchedulerPhase::Executing;
        Some(entry)
    }

    /// Mark the in-flight action finished. The caller resumes scanning.
    pub fn finish_execution(&mut self) {
        self.executing = None;
        self.phase = SchedulerPhase::Scanning;
    }

    /// Release the lock held by the given root. No-op for any other root.
    pub fn release(&mut self, root: ThunkId) {
        if self.locked_root == Some(root) {
            info!(root = %root, "thunk tree released the scheduler lock");
            self.locked_root = None;
            self.tree_keys.clear();
            self.tree_keys_complete = true;
        }
    }

    /// Reject every queued entry (engine shutdown).
    pub fn drain_all(&mut self) -> Vec<QueuedAction> {
        self.queue.drain(..).collect()
    }

    fn pick_index(&self, thunks: &ThunkManager) -> Option<usize> {
        // Locked-tree actions first, in FIFO order among themselves.
        if let Some(locked) = self.locked_root {
            let of_locked_tree = self.queue.iter().position(|qa| {
                qa.action
                    .parent_thunk_id
                    .and_then(|id| thunks.resolve_root(id))
                    .is_some_and(|root| root == locked)
            });
            if of_locked_tree.is_some() {
                return of_locked_tree;
            }
        }
        self.queue.iter().position(|qa| self.runnable(qa, thunks))
    }

    fn runnable(&self, qa: &QueuedAction, thunks: &ThunkManager) -> bool {
        let action = &qa.action;
        if action.bypass_thunk_lock {
            return true;
        }
        let root = action.parent_thunk_id.and_then(|id| thunks.resolve_root(id));
        match (self.locked_root, root) {
            // No lock held: the earliest tree action acquires it; plain
            // actions run freely.
            (None, _) => true,
            // Lock held by this action's own tree.
            (Some(locked), Some(root)) if locked == root => true,
            // Foreign to the locked tree: only the declared-keys fast path
            // lets it through.
            (Some(_), _) => self.keys_disjoint_from_thunk_work(action),
        }
    }

    /// Non-overlapping-keys fast path. The candidate and every thunk
    /// action observed so far (picked, executing, or still queued) must
    /// declare keys, and the candidate's keys must be disjoint from all
    /// of them.
    fn keys_disjoint_from_thunk_work(&self, action: &Action) -> bool {
        let Some(keys) = action.keys.as_deref() else {
            return false;
        };
        if !self.tree_keys_complete {
            return false;
        }
        if keys.iter().any(|k| self.tree_keys.contains(k)) {
            return false;
        }
        if let Some((Some(_), executing_keys)) = &self.executing {
            match executing_keys {
                Some(exec) => {
                    if keys.iter().any(|k| exec.contains(k)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        for queued in &self.queue {
            if queued.action.parent_thunk_id.is_none() {
                continue;
            }
            match queued.action.keys.as_deref() {
                Some(other) => {
                    if keys.iter().any(|k| other.contains(k)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
