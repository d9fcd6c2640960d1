// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The terminal step of the pipeline: apply one action to the store and
//! fan the resulting state out to every connected view.
//!
//! Execution registers the per-view update records with the thunk graph
//! before it returns; it never waits for acknowledgements. The
//! acknowledgement for the action itself is sent by the caller *after*
//! the state updates, so a view can always observe the post-apply version
//! by the time its dispatch resolves.

use indexmap::IndexSet;
use tracing::warn;
use uuid::Uuid;

use statemux_wire::action::{Action, ViewId};
use statemux_wire::envelope::WireMsg;
use statemux_wire::error::Result;

use crate::ipc::IpcHandler;
use crate::store::StateManager;
use crate::subscription::SubscriptionManager;
use crate::thunk::ThunkManager;

/// What one execution produced.
pub struct ExecOutcome {
    /// Post-apply state version, or the processor's error.
    pub result: Result<u64>,
    /// Views whose outbound channel failed while fanning out updates.
    pub dead_views: Vec<ViewId>,
}

/// Execute one action end to end. Never corrupts engine state: a throwing
/// processor only fails this action.
pub fn execute(
    state: &mut StateManager,
    subs: &SubscriptionManager,
    thunks: &mut ThunkManager,
    ipc: &mut IpcHandler,
    action: &Action,
) -> ExecOutcome {
    let mut dead_views = Vec::new();

    let result = match state.process(action) {
        Ok(Some(version)) => {
            let full = state.snapshot();
            let recipients: Vec<ViewId> = subs.views().collect();
            for view_id in recipients {
                let update_id = Uuid::new_v4();
                let slice = subs.slice(view_id, &full);
                if let Some(parent) = action.parent_thunk_id {
                    thunks.track_update(parent, update_id, IndexSet::from([view_id]));
                }
                let msg = WireMsg::StateUpdate {
                    update_id,
                    version,
                    originating_thunk_id: action.parent_thunk_id,
                    slice,
                };
                if ipc.send(view_id, msg).is_err() {
                    dead_views.push(view_id);
                }
            }
            Ok(version)
        }
        Ok(None) => Ok(state.version()),
        Err(e) => {
            warn!(action = %action.action_type, id = %action.id, err = %e, "action processing failed");
            Err(e.with_action(action.id))
        }
    };

    // Executed either way — the action is no longer pending for its thunk.
    if let Some(parent) = action.parent_thunk_id {
        thunks.complete_action(parent, action.id);
    }

    ExecOutcome { result, dead_views }
}
