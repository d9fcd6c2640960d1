// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error taxonomy shared by both sides of the boundary.
//!
//! Every engine-thrown error carries its kind, a message, a timestamp, and
//! a structured context naming the action/thunk/view it concerns. Errors
//! serialise losslessly so a rejection raised in the hub reconstitutes
//! identically in the view that dispatched the action.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::{ActionId, ThunkId, ViewId};

/// Unified error kinds shared across dispatch, thunk, and admin channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Ipc,
    ThunkExecution,
    ActionProcessing,
    Subscription,
    ResourceManagement,
    HandlerResolution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Ipc => "ipc",
            Self::ThunkExecution => "thunk_execution",
            Self::ActionProcessing => "action_processing",
            Self::Subscription => "subscription",
            Self::ResourceManagement => "resource_management",
            Self::HandlerResolution => "handler_resolution",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error happened: which action, thunk, view, and channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thunk_id: Option<ThunkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.action_id.is_none()
            && self.thunk_id.is_none()
            && self.view_id.is_none()
            && self.channel.is_none()
    }
}

/// A serialisable engine error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "ErrorContext::is_empty")]
    pub context: ErrorContext,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), timestamp_ms: now_ms(), context: ErrorContext::default() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn ipc(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ipc, message)
    }

    pub fn thunk(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ThunkExecution, message)
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionProcessing, message)
    }

    pub fn subscription(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Subscription, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceManagement, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerResolution, message)
    }

    pub fn with_action(mut self, id: ActionId) -> Self {
        self.context.action_id = Some(id);
        self
    }

    pub fn with_thunk(mut self, id: ThunkId) -> Self {
        self.context.thunk_id = Some(id);
        self
    }

    pub fn with_view(mut self, id: ViewId) -> Self {
        self.context.view_id = Some(id);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.context.channel = Some(channel.into());
        self
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
