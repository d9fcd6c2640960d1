// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Action envelopes and the ids used across the whole system.
//!
//! User code supplies a `type` and optionally a payload; everything else
//! is engine metadata assigned at the dispatch boundary and never by the
//! caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Numeric id assigned to each view connection by the hub.
pub type ViewId = u64;

pub type ActionId = Uuid;
pub type ThunkId = Uuid;
pub type UpdateId = Uuid;
pub type RequestId = Uuid;

fn is_false(b: &bool) -> bool {
    !*b
}

/// A named request to transform the authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Namespaced identifier such as `COUNTER:INCREMENT`.
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    // Engine metadata, assigned at the boundary.
    pub id: ActionId,
    pub source_view_id: ViewId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_thunk_id: Option<ThunkId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bypass_thunk_lock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bypass_access_control: bool,
    /// Top-level state keys the action is declared to touch. Drives both
    /// the access-control check and the non-overlapping-keys fast path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Flush the outbound batch immediately when this action enqueues.
    #[serde(default, skip_serializing_if = "is_false")]
    pub priority: bool,
}

impl Action {
    /// Build a bare action with a fresh id and no payload.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            id: Uuid::new_v4(),
            source_view_id: 0,
            parent_thunk_id: None,
            bypass_thunk_lock: false,
            bypass_access_control: false,
            keys: None,
            priority: false,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_parent(mut self, thunk_id: ThunkId) -> Self {
        self.parent_thunk_id = Some(thunk_id);
        self
    }

    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn bypassing_thunk_lock(mut self) -> Self {
        self.bypass_thunk_lock = true;
        self
    }

    pub fn bypassing_access_control(mut self) -> Self {
        self.bypass_access_control = true;
        self
    }

    /// Reject action types the engine cannot route: empty, whitespace, or
    /// control characters. This is the only dispatch-time programmer error
    /// surfaced synchronously.
    pub fn validate_type(&self) -> Result<()> {
        if self.action_type.trim().is_empty() {
            return Err(EngineError::action("action type must not be empty").with_action(self.id));
        }
        if self.action_type.chars().any(char::is_control) {
            return Err(EngineError::action("action type contains control characters")
                .with_action(self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "action_tests.rs"]
mod tests;
