// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thunks originating in the authoritative process.
//!
//! Same registration, lock, and completion discipline as view thunks —
//! from the queue's perspective the origin is irrelevant. The user
//! function gets a [`ThunkContext`] whose `dispatch` tags every action
//! with the thunk's id and whose `state` reads the StateManager directly.

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use statemux_wire::action::{Action, ThunkId, ViewId};
use statemux_wire::error::Result;

use crate::runtime::HubHandle;
use crate::thunk::{ThunkSource, ThunkSpec};

/// Options for [`MainThunkProcessor::execute_thunk`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThunkOptions {
    /// View the thunk is attributed to (0 = the hub itself).
    pub view_id: Option<ViewId>,
    /// Parent for nested execution.
    pub parent_id: Option<ThunkId>,
}

/// A user thunk body: reads state and dispatches across arbitrary
/// suspensions, resolving to the thunk's result.
pub type ThunkFn = Box<dyn FnOnce(ThunkContext) -> BoxFuture<'static, Result<Value>> + Send>;

/// Bindings handed to an executing authoritative thunk.
#[derive(Debug, Clone)]
pub struct ThunkContext {
    handle: HubHandle,
    thunk_id: ThunkId,
}

impl ThunkContext {
    pub fn thunk_id(&self) -> ThunkId {
        self.thunk_id
    }

    /// Current version and full authoritative state.
    pub async fn state(&self) -> Result<(u64, Value)> {
        self.handle.state().await
    }

    /// Dispatch one action on behalf of this thunk. Resolves with the
    /// post-apply state version.
    pub async fn dispatch(&self, mut action: Action) -> Result<u64> {
        action.parent_thunk_id = Some(self.thunk_id);
        self.handle.dispatch(action).await
    }

    /// Run a nested thunk; its root is this thunk's root and the parent
    /// resolves only after the child is fully complete.
    pub async fn execute_thunk(&self, thunk: ThunkFn) -> Result<Option<Value>> {
        let processor = MainThunkProcessor::new(self.handle.clone());
        let opts = ThunkOptions { view_id: None, parent_id: Some(self.thunk_id) };
        processor.execute_thunk(thunk, opts).await
    }
}

/// Runs authoritative-origin thunks through the scheduler discipline.
#[derive(Debug, Clone)]
pub struct MainThunkProcessor {
    handle: HubHandle,
}

impl MainThunkProcessor {
    pub fn new(handle: HubHandle) -> Self {
        Self { handle }
    }

    /// Register and run one thunk. Resolves with the thunk's result once
    /// the whole tree is fully complete: every dispatched action executed
    /// and every resulting state update acknowledged.
    pub async fn execute_thunk(&self, thunk: ThunkFn, opts: ThunkOptions) -> Result<Option<Value>> {
        let thunk_id = Uuid::new_v4();
        let spec = ThunkSpec {
            id: thunk_id,
            source_view_id: opts.view_id.unwrap_or(0),
            parent_id: opts.parent_id,
            source: ThunkSource::Authoritative,
            bypass_thunk_lock: false,
            bypass_access_control: false,
        };
        let done = self.handle.register_thunk(spec).await?;

        let ctx = ThunkContext { handle: self.handle.clone(), thunk_id };
        let outcome = thunk(ctx).await;
        let settle = match &outcome {
            Ok(value) => Ok(Some(value.clone())),
            Err(e) => Err(e.clone()),
        };
        self.handle.settle_thunk(thunk_id, settle).await?;

        let done = done
            .await
            .map_err(|_| statemux_wire::error::EngineError::ipc("hub is not running"))?;
        match done.error {
            Some(e) => Err(e),
            None => Ok(done.result),
        }
    }
}

#[cfg(test)]
#[path = "main_thunk_tests.rs"]
mod tests;
