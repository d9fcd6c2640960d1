// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound dispatch coalescing.
//!
//! Synchronous bursts of dispatches leave the view as one batch message.
//! A batch flushes when it reaches the configured size, when the window
//! since its first enqueue elapses, or immediately when a priority action
//! enqueues. Order within a batch is insertion order; thunk control
//! messages are never batched.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use statemux_wire::action::Action;
use statemux_wire::config::EngineConfig;

/// Insertion-ordered buffer of outbound actions.
pub struct ActionBatcher {
    buffer: Vec<Action>,
    window: Duration,
    max_size: usize,
    priority_threshold: usize,
    enabled: bool,
    first_enqueued_at: Option<Instant>,
}

impl ActionBatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            buffer: Vec::new(),
            window: config.batch_window(),
            max_size: config.batching.max_batch_size,
            priority_threshold: config.batching.priority_flush_threshold,
            enabled: config.enable_batching,
            first_enqueued_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add one action. Returns the batch to send when this enqueue
    /// triggers a flush (size reached, or a priority action with the
    /// buffer at or past the priority threshold).
    pub fn push(&mut self, action: Action) -> Option<Vec<Action>> {
        if !self.enabled {
            return Some(vec![action]);
        }
        let priority = action.priority;
        if self.buffer.is_empty() {
            self.first_enqueued_at = Some(Instant::now());
        }
        self.buffer.push(action);
        trace!(buffered = self.buffer.len(), "action buffered");

        if self.buffer.len() >= self.max_size
            || (priority && self.buffer.len() > self.priority_threshold)
        {
            return self.take();
        }
        None
    }

    /// When the current buffer must be flushed at the latest.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_enqueued_at.map(|at| at + self.window)
    }

    /// Flush everything buffered (window expiry or an ordering barrier
    /// such as an outgoing thunk control message).
    pub fn take(&mut self) -> Option<Vec<Action>> {
        self.first_enqueued_at = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;
