// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The hub task: single-threaded cooperative owner of every authoritative
//! component.
//!
//! All shared-data mutation happens here. Commands arrive on one channel
//! (view traffic pumped by the per-connection reader tasks, plus local
//! dispatches and administrative queries); after every command the
//! scheduler drains whatever became runnable, yielding between executed
//! actions so thunk lifecycle events are observed before the next scan.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use statemux_wire::action::{Action, ActionId, ThunkId, ViewId};
use statemux_wire::config::EngineConfig;
use statemux_wire::envelope::{Envelope, ThunkSummary, WireMsg};
use statemux_wire::error::{EngineError, Result};
use statemux_wire::transport::MessagePort;

use crate::executor;
use crate::ipc::IpcHandler;
use crate::scheduler::{ActionScheduler, Completion};
use crate::store::{ActionProcessor, StateManager};
use crate::subscription::SubscriptionManager;
use crate::thunk::{ThunkEvent, ThunkManager, ThunkSource, ThunkSpec};

/// How often the hub sweeps thunk deadlines and expired update records.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the hub command channel.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Final outcome of a thunk tree, delivered to the registerer.
#[derive(Debug)]
pub struct ThunkOutcome {
    pub result: Option<Value>,
    pub error: Option<EngineError>,
}

/// Commands processed by the hub task.
#[derive(Debug)]
pub enum HubCmd {
    FromView { view_id: ViewId, envelope: Envelope },
    ViewClosed { view_id: ViewId },
    Connect { port: MessagePort, reply: oneshot::Sender<ViewId> },
    LocalDispatch { action: Action, reply: oneshot::Sender<Result<u64>> },
    RegisterThunk { spec: ThunkSpec, reply: oneshot::Sender<Result<oneshot::Receiver<ThunkOutcome>>> },
    SettleThunk { thunk_id: ThunkId, outcome: Result<Option<Value>> },
    GetState { view_id: Option<ViewId>, reply: oneshot::Sender<(u64, Value)> },
    GetThunks { reply: oneshot::Sender<Vec<ThunkSummary>> },
}

/// The authoritative side. Owns the hub task; [`Hub::destroy`] stops it
/// and rejects everything pending. Dropping instead lets the task run on
/// until the last [`HubHandle`] is gone.
pub struct Hub {
    handle: HubHandle,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl Hub {
    /// Validate the configuration, wrap the host store, and start the hub
    /// task on the current tokio runtime.
    pub fn spawn(processor: impl ActionProcessor, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let runtime = HubRuntime {
            state: StateManager::new(processor),
            subs: SubscriptionManager::new(),
            thunks: ThunkManager::new(config.max_queue_size, config.thunk_completion_timeout()),
            scheduler: ActionScheduler::new(config.max_queue_size),
            ipc: IpcHandler::new(cmd_tx.clone(), shutdown.clone()),
            config,
            cmd_rx,
            local_waiters: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        let join = tokio::spawn(runtime.run());
        Ok(Self { handle: HubHandle { cmd_tx }, shutdown, join })
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Clean shutdown: stop the hub task and reject everything pending.
    pub async fn destroy(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }
}

/// Cloneable entry point for authoritative-side user code.
#[derive(Debug, Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCmd>,
}

impl HubHandle {
    /// Attach one view over its message port. Returns the assigned view id.
    pub async fn connect_view(&self, port: MessagePort) -> Result<ViewId> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCmd::Connect { port, reply }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    /// Dispatch one action from authoritative user code. Resolves with
    /// the post-apply state version.
    pub async fn dispatch(&self, action: Action) -> Result<u64> {
        action.validate_type()?;
        let (reply, rx) = oneshot::channel();
        self.send(HubCmd::LocalDispatch { action, reply }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    /// Current version and full state snapshot.
    pub async fn state(&self) -> Result<(u64, Value)> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCmd::GetState { view_id: None, reply }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    /// Compact snapshot of the active thunk graph.
    pub async fn thunks(&self) -> Result<Vec<ThunkSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCmd::GetThunks { reply }).await?;
        rx.await.map_err(|_| engine_stopped())
    }

    pub(crate) async fn register_thunk(
        &self,
        spec: ThunkSpec,
    ) -> Result<oneshot::Receiver<ThunkOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCmd::RegisterThunk { spec, reply }).await?;
        rx.await.map_err(|_| engine_stopped())?
    }

    pub(crate) async fn settle_thunk(
        &self,
        thunk_id: ThunkId,
        outcome: Result<Option<Value>>,
    ) -> Result<()> {
        self.send(HubCmd::SettleThunk { thunk_id, outcome }).await
    }

    async fn send(&self, cmd: HubCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| engine_stopped())
    }
}

fn engine_stopped() -> EngineError {
    EngineError::ipc("hub is not running").with_channel("hub")
}

struct HubRuntime {
    state: StateManager,
    subs: SubscriptionManager,
    thunks: ThunkManager,
    scheduler: ActionScheduler,
    ipc: IpcHandler,
    config: EngineConfig,
    cmd_rx: mpsc::Receiver<HubCmd>,
    local_waiters: HashMap<ThunkId, oneshot::Sender<ThunkOutcome>>,
    shutdown: CancellationToken,
}

impl HubRuntime {
    async fn run(mut self) {
        info!("hub started");
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_cmd(cmd);
                        self.drain().await;
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.thunks.sweep_deadlines();
                    self.thunks.sweep_expired_updates(self.config.update_max_age());
                    self.drain().await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
        self.teardown();
        info!("hub stopped");
    }

    fn handle_cmd(&mut self, cmd: HubCmd) {
        match cmd {
            HubCmd::FromView { view_id, envelope } => self.handle_view_msg(view_id, envelope.msg),
            HubCmd::ViewClosed { view_id } => self.view_dead(view_id),
            HubCmd::Connect { port, reply } => {
                let view_id = self.ipc.connect(port);
                self.subs.connect(view_id);
                info!(view_id, "view connected");
                self.send_initial_state(view_id);
                let _ = reply.send(view_id);
            }
            HubCmd::LocalDispatch { action, reply } => self.intake_local(action, reply),
            HubCmd::RegisterThunk { spec, reply } => {
                let thunk_id = spec.id;
                match self.thunks.register(spec) {
                    Ok(()) => {
                        let (done_tx, done_rx) = oneshot::channel();
                        self.local_waiters.insert(thunk_id, done_tx);
                        let _ = reply.send(Ok(done_rx));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            HubCmd::SettleThunk { thunk_id, outcome } => {
                let settled = match outcome {
                    Ok(result) => self.thunks.complete(thunk_id, result),
                    Err(e) => self.thunks.fail(thunk_id, e),
                };
                if let Err(e) = settled {
                    warn!(thunk = %thunk_id, err = %e, "thunk settle refused");
                }
            }
            HubCmd::GetState { view_id, reply } => {
                let full = self.state.snapshot();
                let slice = match view_id {
                    Some(v) => self.subs.slice(v, &full),
                    None => full,
                };
                let _ = reply.send((self.state.version(), slice));
            }
            HubCmd::GetThunks { reply } => {
                let _ = reply.send(self.thunks.summaries());
            }
        }
    }

    fn handle_view_msg(&mut self, view_id: ViewId, msg: WireMsg) {
        match msg {
            WireMsg::Dispatch { action } => self.intake_from_view(view_id, action),
            WireMsg::DispatchBatch { actions } => {
                for action in actions {
                    self.intake_from_view(view_id, action);
                }
            }
            WireMsg::StateUpdateAck { update_id } => {
                self.thunks.acknowledge_update(update_id, view_id);
            }
            WireMsg::RegisterThunk { thunk_id, parent_id, bypass_thunk_lock, bypass_access_control } => {
                let spec = ThunkSpec {
                    id: thunk_id,
                    source_view_id: view_id,
                    parent_id,
                    source: ThunkSource::View,
                    bypass_thunk_lock,
                    bypass_access_control,
                };
                let error = self.thunks.register(spec).err();
                self.send_or_mark_dead(view_id, WireMsg::RegisterThunkAck { thunk_id, error });
            }
            WireMsg::CompleteThunk { thunk_id, result, error } => {
                self.complete_view_thunk(view_id, thunk_id, result, error);
            }
            WireMsg::Subscribe { keys } => self.subs.subscribe(view_id, keys),
            WireMsg::Unsubscribe { keys } => self.subs.unsubscribe(view_id, &keys),
            WireMsg::GetState { request_id } => {
                let slice = self.subs.slice(view_id, &self.state.snapshot());
                let msg = WireMsg::StateReply { request_id, version: self.state.version(), slice };
                self.send_or_mark_dead(view_id, msg);
            }
            WireMsg::GetSubscriptions { request_id } => {
                let msg = WireMsg::SubscriptionsReply { request_id, keys: self.subs.current(view_id) };
                self.send_or_mark_dead(view_id, msg);
            }
            WireMsg::GetThunkState { request_id } => {
                let msg = WireMsg::ThunkStateReply { request_id, active: self.thunks.summaries() };
                self.send_or_mark_dead(view_id, msg);
            }
            other => {
                warn!(view_id, kind = ?other, "hub received a hub-to-view message");
            }
        }
    }

    /// Intake one action dispatched by a view: assign the boundary
    /// metadata, run the checks, and enqueue. Every refusal is reported
    /// through the action's acknowledgement.
    fn intake_from_view(&mut self, view_id: ViewId, mut action: Action) {
        action.source_view_id = view_id;
        if action.keys.as_ref().is_some_and(Vec::is_empty) {
            action.keys = None;
        }
        let action_id = action.id;
        let parent = action.parent_thunk_id;

        if let Err(e) = action.validate_type() {
            self.ack_error(view_id, action_id, e);
            return;
        }
        if let Err(e) = self.subs.check_access(view_id, &action) {
            self.ack_error(view_id, action_id, e);
            return;
        }
        if let Some(parent) = parent {
            if let Err(e) = self.thunks.record_action(parent, action_id) {
                self.ack_error(view_id, action_id, e);
                return;
            }
        }
        if let Err(rejected) = self.scheduler.enqueue(action, Completion::View { view_id }) {
            if let Some(parent) = parent {
                self.thunks.complete_action(parent, action_id);
            }
            let error = self.scheduler.overflow_error(&rejected.action);
            self.ack_error(view_id, action_id, error);
        }
    }

    fn intake_local(&mut self, mut action: Action, reply: oneshot::Sender<Result<u64>>) {
        action.source_view_id = 0;
        if action.keys.as_ref().is_some_and(Vec::is_empty) {
            action.keys = None;
        }
        let action_id = action.id;
        let parent = action.parent_thunk_id;

        if let Some(parent) = parent {
            if let Err(e) = self.thunks.record_action(parent, action_id) {
                let _ = reply.send(Err(e));
                return;
            }
        }
        if let Err(rejected) = self.scheduler.enqueue(action, Completion::Local { reply }) {
            if let Some(parent) = parent {
                self.thunks.complete_action(parent, action_id);
            }
            let error = self.scheduler.overflow_error(&rejected.action);
            warn!(action = %action_id, err = %error, "local dispatch rejected");
            if let Completion::Local { reply } = rejected.completion {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn complete_view_thunk(
        &mut self,
        view_id: ViewId,
        thunk_id: ThunkId,
        result: Option<Value>,
        error: Option<EngineError>,
    ) {
        let owned = self.thunks.get(thunk_id).is_some_and(|t| t.source_view_id == view_id);
        if !owned {
            let err = EngineError::thunk("complete for a thunk this view does not own")
                .with_thunk(thunk_id)
                .with_view(view_id);
            warn!(view_id, thunk = %thunk_id, "spurious complete-thunk");
            let msg = WireMsg::ThunkDone { thunk_id, result: None, error: Some(err) };
            self.send_or_mark_dead(view_id, msg);
            return;
        }
        let settled = match error {
            Some(e) => self.thunks.fail(thunk_id, e),
            None => self.thunks.complete(thunk_id, result),
        };
        if let Err(e) = settled {
            warn!(thunk = %thunk_id, err = %e, "thunk settle refused");
        }
    }

    fn send_initial_state(&mut self, view_id: ViewId) {
        let slice = self.subs.slice(view_id, &self.state.snapshot());
        let msg = WireMsg::StateUpdate {
            update_id: Uuid::new_v4(),
            version: self.state.version(),
            originating_thunk_id: None,
            slice,
        };
        self.send_or_mark_dead(view_id, msg);
    }

    fn ack_error(&mut self, view_id: ViewId, action_id: ActionId, error: EngineError) {
        debug!(view_id, action = %action_id, err = %error, "dispatch rejected");
        let msg = WireMsg::DispatchAck { action_id, version: 0, error: Some(error) };
        self.send_or_mark_dead(view_id, msg);
    }

    fn send_or_mark_dead(&mut self, view_id: ViewId, msg: WireMsg) {
        if self.ipc.send(view_id, msg).is_err() && self.subs.is_connected(view_id) {
            self.view_dead(view_id);
        }
    }

    fn view_dead(&mut self, view_id: ViewId) {
        if !self.subs.is_connected(view_id) {
            return;
        }
        info!(view_id, "view disconnected");
        self.ipc.disconnect(view_id);
        self.subs.disconnect(view_id);
        self.thunks.cleanup_dead_view(view_id);
    }

    /// The scan/execute loop. Runs after every command until nothing is
    /// runnable; the guard keeps a re-entrant call from nesting the loop.
    async fn drain(&mut self) {
        if !self.scheduler.begin_scan() {
            return;
        }
        loop {
            self.process_thunk_events();
            let Some(entry) = self.scheduler.pop_runnable(&self.thunks) else {
                break;
            };
            let outcome = executor::execute(
                &mut self.state,
                &self.subs,
                &mut self.thunks,
                &mut self.ipc,
                &entry.action,
            );
            self.scheduler.finish_execution();

            match entry.completion {
                Completion::View { view_id } => {
                    let (version, error) = match &outcome.result {
                        Ok(version) => (*version, None),
                        Err(e) => (0, Some(e.clone())),
                    };
                    let msg = WireMsg::DispatchAck { action_id: entry.action.id, version, error };
                    self.send_or_mark_dead(view_id, msg);
                }
                Completion::Local { reply } => {
                    let _ = reply.send(outcome.result);
                }
            }
            for view_id in outcome.dead_views {
                self.view_dead(view_id);
            }

            self.process_thunk_events();
            // Drop to the task queue so lifecycle observers run before the
            // next scan iteration.
            tokio::task::yield_now().await;
        }
        self.scheduler.end_scan();
    }

    /// Drain thunk lifecycle events until the graph is stable: notify
    /// registerers, remove fully complete records (post-order), release
    /// the lock on root completion, and broadcast the active snapshot.
    fn process_thunk_events(&mut self) {
        let mut snapshot_dirty = false;
        loop {
            let events = self.thunks.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                match event {
                    ThunkEvent::Started { .. }
                    | ThunkEvent::Completed { .. }
                    | ThunkEvent::Failed { .. } => snapshot_dirty = true,
                    ThunkEvent::FullyComplete { thunk_id, source, source_view_id, result, error } => {
                        snapshot_dirty = true;
                        match source {
                            ThunkSource::View => {
                                let msg = WireMsg::ThunkDone { thunk_id, result, error };
                                self.send_or_mark_dead(source_view_id, msg);
                            }
                            ThunkSource::Authoritative => {
                                if let Some(tx) = self.local_waiters.remove(&thunk_id) {
                                    let _ = tx.send(ThunkOutcome { result, error });
                                }
                            }
                        }
                        self.thunks.remove(thunk_id);
                    }
                    ThunkEvent::RootCompleted { root_id } => {
                        self.scheduler.release(root_id);
                    }
                }
            }
        }
        if snapshot_dirty {
            let active = self.thunks.summaries();
            let dead = self.ipc.broadcast(|_| WireMsg::ThunkState { active: active.clone() });
            for view_id in dead {
                self.view_dead(view_id);
            }
        }
    }

    /// Reject everything still pending on shutdown.
    fn teardown(&mut self) {
        for entry in self.scheduler.drain_all() {
            match entry.completion {
                Completion::View { view_id } => {
                    let msg = WireMsg::DispatchAck {
                        action_id: entry.action.id,
                        version: 0,
                        error: Some(engine_stopped().with_action(entry.action.id)),
                    };
                    let _ = self.ipc.send(view_id, msg);
                }
                Completion::Local { reply } => {
                    let _ = reply.send(Err(engine_stopped().with_action(entry.action.id)));
                }
            }
        }
        for (thunk_id, waiter) in self.local_waiters.drain() {
            let _ = waiter.send(ThunkOutcome {
                result: None,
                error: Some(engine_stopped().with_thunk(thunk_id)),
            });
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
