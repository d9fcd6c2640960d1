// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration shared by both sides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Outbound batching knobs (view side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Time window from the first enqueue until the batch is flushed.
    pub window_ms: u64,
    /// Flush as soon as the batch reaches this many actions.
    pub max_batch_size: usize,
    /// Buffer length at or above which a priority action triggers an
    /// immediate flush. 0 flushes on every priority enqueue.
    pub priority_flush_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { window_ms: 16, max_batch_size: 10, priority_flush_threshold: 0 }
    }
}

/// Payload serialisation knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializeConfig {
    pub max_depth: usize,
}

impl Default for SerializeConfig {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pending actions the hub queue will hold before rejecting.
    pub max_queue_size: usize,
    /// Per-action acknowledgement deadline.
    pub action_completion_timeout_ms: u64,
    /// Deadline for a registered thunk to reach a terminal state.
    pub thunk_completion_timeout_ms: u64,
    /// Age bound for state-update records awaiting acknowledgement.
    pub update_max_age_ms: u64,
    pub batching: BatchConfig,
    pub serialization: SerializeConfig,
    pub enable_batching: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            action_completion_timeout_ms: 30_000,
            thunk_completion_timeout_ms: 30_000,
            update_max_age_ms: 60_000,
            batching: BatchConfig::default(),
            serialization: SerializeConfig::default(),
            enable_batching: true,
        }
    }
}

impl EngineConfig {
    /// Defaults for host platforms with slower IPC: the acknowledgement
    /// deadline is doubled.
    pub fn slow_host() -> Self {
        Self { action_completion_timeout_ms: 60_000, ..Self::default() }
    }

    /// Validate option values after construction.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(EngineError::configuration("max_queue_size must be at least 1"));
        }
        if self.action_completion_timeout_ms == 0 {
            return Err(EngineError::configuration("action_completion_timeout_ms must be nonzero"));
        }
        if self.thunk_completion_timeout_ms == 0 {
            return Err(EngineError::configuration("thunk_completion_timeout_ms must be nonzero"));
        }
        if self.batching.max_batch_size == 0 {
            return Err(EngineError::configuration("batching.max_batch_size must be at least 1"));
        }
        if self.serialization.max_depth == 0 {
            return Err(EngineError::configuration("serialization.max_depth must be at least 1"));
        }
        Ok(())
    }

    pub fn action_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.action_completion_timeout_ms)
    }

    pub fn thunk_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.thunk_completion_timeout_ms)
    }

    pub fn update_max_age(&self) -> Duration {
        Duration::from_millis(self.update_max_age_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batching.window_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
