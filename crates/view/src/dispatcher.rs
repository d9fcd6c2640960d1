// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The view-side dispatch surface and its runtime task.
//!
//! [`ViewDispatcher`] is the single public entry point: it accepts a bare
//! action type, a type with payload, a full envelope, or a thunk, and
//! returns the authoritative state visible to this view once the dispatch
//! has been applied and mirrored back. The runtime task owns the port,
//! the batcher, and the pending-action registry; user tasks only touch
//! the mirror and the command channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use statemux_wire::action::{Action, RequestId, ThunkId};
use statemux_wire::config::EngineConfig;
use statemux_wire::envelope::{Envelope, Sequencer, SubscriptionSpec, ThunkSummary, WireMsg};
use statemux_wire::error::{EngineError, Result};
use statemux_wire::transport::{MessagePort, PortReceiver, PortSender};

use crate::batcher::ActionBatcher;
use crate::mirror::LocalMirror;
use crate::pending::PendingActions;

/// A thunk body: reads the mirror and dispatches across arbitrary
/// suspensions, resolving to its own result value.
pub type ViewThunk = Box<dyn FnOnce(ThunkHandle) -> BoxFuture<'static, Result<Value>> + Send>;

/// What can be passed to `dispatch`.
pub enum Dispatchable {
    /// A bare action type.
    Type(String),
    /// An action type with a positional payload.
    TypeWithPayload(String, Value),
    /// A prepared envelope.
    Envelope(Action),
    /// A composite workflow.
    Thunk(ViewThunk),
}

impl From<&str> for Dispatchable {
    fn from(action_type: &str) -> Self {
        Self::Type(action_type.to_owned())
    }
}

impl From<String> for Dispatchable {
    fn from(action_type: String) -> Self {
        Self::Type(action_type)
    }
}

impl From<(&str, Value)> for Dispatchable {
    fn from((action_type, payload): (&str, Value)) -> Self {
        Self::TypeWithPayload(action_type.to_owned(), payload)
    }
}

impl From<Action> for Dispatchable {
    fn from(action: Action) -> Self {
        Self::Envelope(action)
    }
}

/// Wrap an async closure as a dispatchable thunk.
pub fn thunk<F, Fut>(body: F) -> Dispatchable
where
    F: FnOnce(ThunkHandle) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Dispatchable::Thunk(Box::new(move |handle| Box::pin(body(handle))))
}

/// Final outcome of a thunk, as reported back by the hub.
struct ThunkOutcome {
    error: Option<EngineError>,
}

enum ViewCmd {
    Dispatch { action: Action, reply: oneshot::Sender<Result<u64>> },
    RegisterThunk {
        thunk_id: ThunkId,
        parent_id: Option<ThunkId>,
        reply: oneshot::Sender<Result<()>>,
    },
    CompleteThunk {
        thunk_id: ThunkId,
        result: Option<Value>,
        error: Option<EngineError>,
        reply: oneshot::Sender<ThunkOutcome>,
    },
    Subscribe { keys: SubscriptionSpec },
    Unsubscribe { keys: Vec<String> },
    QueryState { reply: oneshot::Sender<(u64, Value)> },
    QuerySubscriptions { reply: oneshot::Sender<SubscriptionSpec> },
    QueryThunks { reply: oneshot::Sender<Vec<ThunkSummary>> },
    Shutdown,
}

fn disconnected() -> EngineError {
    EngineError::ipc("view runtime is not running").with_channel("view")
}

/// Public dispatch entry point for one view. Cheap to clone.
#[derive(Clone)]
pub struct ViewDispatcher {
    cmd_tx: mpsc::Sender<ViewCmd>,
    mirror: Arc<LocalMirror>,
}

impl ViewDispatcher {
    /// Attach to the hub over the given port and start the view runtime
    /// on the current tokio runtime.
    pub fn connect(port: MessagePort, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mirror = Arc::new(LocalMirror::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (port_tx, port_rx) = port.split();
        let runtime = ViewRuntime {
            port_tx,
            port_rx,
            seq: Sequencer::new(),
            mirror: Arc::clone(&mirror),
            pending: PendingActions::new(config.max_queue_size),
            batcher: ActionBatcher::new(&config),
            thunk_acks: HashMap::new(),
            thunk_done: HashMap::new(),
            queries: HashMap::new(),
            config,
            cmd_rx,
        };
        tokio::spawn(runtime.run());
        Ok(Self { cmd_tx, mirror })
    }

    /// Current mirror snapshot. Never blocks and never goes to the hub.
    pub fn state(&self) -> Value {
        self.mirror.snapshot()
    }

    /// Version of the last observed state update.
    pub fn version(&self) -> u64 {
        self.mirror.version()
    }

    /// Wait until the mirror has observed at least the given version
    /// (e.g. 1 for the initial snapshot after connecting).
    pub async fn wait_for_version(&self, version: u64) {
        self.mirror.wait_for(version).await;
    }

    /// Dispatch an action or thunk. Resolves with the authoritative state
    /// visible to this view after the dispatch has been applied.
    pub async fn dispatch(&self, dispatchable: impl Into<Dispatchable>) -> Result<Value> {
        self.dispatch_inner(dispatchable.into(), None).await
    }

    /// Narrow or widen this view's subscription.
    pub async fn subscribe(&self, keys: SubscriptionSpec) -> Result<()> {
        self.send_cmd(ViewCmd::Subscribe { keys }).await
    }

    pub async fn unsubscribe(&self, keys: Vec<String>) -> Result<()> {
        self.send_cmd(ViewCmd::Unsubscribe { keys }).await
    }

    /// The subscription as the hub sees it.
    pub async fn current_subscriptions(&self) -> Result<SubscriptionSpec> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(ViewCmd::QuerySubscriptions { reply }).await?;
        rx.await.map_err(|_| disconnected())
    }

    /// Authoritative state (sliced for this view), fetched from the hub.
    pub async fn remote_state(&self) -> Result<(u64, Value)> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(ViewCmd::QueryState { reply }).await?;
        rx.await.map_err(|_| disconnected())
    }

    /// Active thunk graph snapshot, fetched from the hub.
    pub async fn thunk_state(&self) -> Result<Vec<ThunkSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(ViewCmd::QueryThunks { reply }).await?;
        rx.await.map_err(|_| disconnected())
    }

    /// Stop the view runtime and reject everything outstanding.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ViewCmd::Shutdown).await;
    }

    async fn send_cmd(&self, cmd: ViewCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| disconnected())
    }

    async fn dispatch_inner(
        &self,
        dispatchable: Dispatchable,
        parent: Option<ThunkId>,
    ) -> Result<Value> {
        let mut action = match dispatchable {
            Dispatchable::Thunk(body) => return self.run_thunk(body, parent).await,
            Dispatchable::Type(action_type) => Action::new(action_type),
            Dispatchable::TypeWithPayload(action_type, payload) => {
                Action::new(action_type).with_payload(payload)
            }
            Dispatchable::Envelope(action) => action,
        };
        // Programmer errors throw synchronously; everything else rejects
        // the returned future.
        action.validate_type()?;
        if let Some(parent) = parent {
            action.parent_thunk_id = Some(parent);
        }

        let (reply, rx) = oneshot::channel();
        self.send_cmd(ViewCmd::Dispatch { action, reply }).await?;
        let version = rx.await.map_err(|_| disconnected())??;

        // Resolve only once the mirror has caught up to the post-apply
        // version.
        self.mirror.wait_for(version).await;
        Ok(self.mirror.snapshot())
    }

    async fn run_thunk(&self, body: ViewThunk, parent: Option<ThunkId>) -> Result<Value> {
        let thunk_id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.send_cmd(ViewCmd::RegisterThunk { thunk_id, parent_id: parent, reply }).await?;
        rx.await.map_err(|_| disconnected())??;

        let outcome = body(ThunkHandle { dispatcher: self.clone(), thunk_id }).await;
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };

        let (reply, done_rx) = oneshot::channel();
        self.send_cmd(ViewCmd::CompleteThunk { thunk_id, result, error, reply }).await?;
        let done = done_rx.await.map_err(|_| disconnected())?;
        match done.error {
            Some(e) => Err(e),
            None => Ok(self.mirror.snapshot()),
        }
    }
}

/// Bindings handed to an executing thunk: a `state` reading the mirror
/// and a `dispatch` that chains parentage onto everything it routes.
#[derive(Clone)]
pub struct ThunkHandle {
    dispatcher: ViewDispatcher,
    thunk_id: ThunkId,
}

impl ThunkHandle {
    pub fn thunk_id(&self) -> ThunkId {
        self.thunk_id
    }

    pub fn state(&self) -> Value {
        self.dispatcher.state()
    }

    /// Dispatch on behalf of this thunk; nested thunks chain naturally.
    pub async fn dispatch(&self, dispatchable: impl Into<Dispatchable>) -> Result<Value> {
        self.dispatcher.dispatch_inner(dispatchable.into(), Some(self.thunk_id)).await
    }
}

enum PendingQuery {
    State(oneshot::Sender<(u64, Value)>),
    Subscriptions(oneshot::Sender<SubscriptionSpec>),
    Thunks(oneshot::Sender<Vec<ThunkSummary>>),
}

struct ViewRuntime {
    port_tx: PortSender,
    port_rx: PortReceiver,
    seq: Sequencer,
    mirror: Arc<LocalMirror>,
    pending: PendingActions,
    batcher: ActionBatcher,
    thunk_acks: HashMap<ThunkId, oneshot::Sender<Result<()>>>,
    thunk_done: HashMap<ThunkId, oneshot::Sender<ThunkOutcome>>,
    queries: HashMap<RequestId, PendingQuery>,
    config: EngineConfig,
    cmd_rx: mpsc::Receiver<ViewCmd>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ViewRuntime {
    async fn run(mut self) {
        debug!("view runtime started");
        loop {
            let batch_deadline = self.batcher.deadline();
            let ack_deadline = self.pending.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ViewCmd::Shutdown) | None => break,
                    Some(cmd) => {
                        if self.handle_cmd(cmd).await.is_err() {
                            break;
                        }
                    }
                },
                envelope = self.port_rx.recv() => match envelope {
                    Some(envelope) => {
                        if self.handle_envelope(envelope).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("hub closed the connection");
                        break;
                    }
                },
                _ = sleep_until_opt(batch_deadline) => {
                    if self.flush_batch().await.is_err() {
                        break;
                    }
                }
                _ = sleep_until_opt(ack_deadline) => {
                    self.pending.sweep(Instant::now());
                }
            }
        }
        self.teardown();
        info!("view runtime stopped");
    }

    async fn handle_cmd(&mut self, cmd: ViewCmd) -> Result<()> {
        match cmd {
            ViewCmd::Dispatch { action, reply } => {
                let deadline = Instant::now() + self.config.action_completion_timeout();
                match self.pending.register(action.id, reply, deadline) {
                    Ok(()) => {
                        if let Some(batch) = self.batcher.push(action) {
                            self.send_batch(batch).await?;
                        }
                    }
                    Err((reply, error)) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            ViewCmd::RegisterThunk { thunk_id, parent_id, reply } => {
                // Control messages are never batched, but the actions
                // already buffered must not be overtaken by one.
                self.flush_batch().await?;
                self.thunk_acks.insert(thunk_id, reply);
                self.send_msg(WireMsg::RegisterThunk {
                    thunk_id,
                    parent_id,
                    bypass_thunk_lock: false,
                    bypass_access_control: false,
                })
                .await?;
            }
            ViewCmd::CompleteThunk { thunk_id, result, error, reply } => {
                self.flush_batch().await?;
                self.thunk_done.insert(thunk_id, reply);
                self.send_msg(WireMsg::CompleteThunk { thunk_id, result, error }).await?;
            }
            ViewCmd::Subscribe { keys } => {
                self.flush_batch().await?;
                self.send_msg(WireMsg::Subscribe { keys }).await?;
            }
            ViewCmd::Unsubscribe { keys } => {
                self.flush_batch().await?;
                self.send_msg(WireMsg::Unsubscribe { keys }).await?;
            }
            ViewCmd::QueryState { reply } => {
                let request_id = Uuid::new_v4();
                self.queries.insert(request_id, PendingQuery::State(reply));
                self.send_msg(WireMsg::GetState { request_id }).await?;
            }
            ViewCmd::QuerySubscriptions { reply } => {
                let request_id = Uuid::new_v4();
                self.queries.insert(request_id, PendingQuery::Subscriptions(reply));
                self.send_msg(WireMsg::GetSubscriptions { request_id }).await?;
            }
            ViewCmd::QueryThunks { reply } => {
                let request_id = Uuid::new_v4();
                self.queries.insert(request_id, PendingQuery::Thunks(reply));
                self.send_msg(WireMsg::GetThunkState { request_id }).await?;
            }
            ViewCmd::Shutdown => {} // handled by the loop
        }
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let gap = self.seq.check(&envelope);
        if gap > 0 {
            warn!(seq = envelope.seq, gap, "out-of-sequence message from the hub");
        }
        match envelope.msg {
            WireMsg::StateUpdate { update_id, version, slice, .. } => {
                self.mirror.apply(version, slice);
                self.send_msg(WireMsg::StateUpdateAck { update_id }).await?;
            }
            WireMsg::DispatchAck { action_id, version, error } => {
                let outcome = match error {
                    Some(e) => Err(e),
                    None => Ok(version),
                };
                self.pending.resolve(action_id, outcome);
            }
            WireMsg::RegisterThunkAck { thunk_id, error } => {
                if let Some(reply) = self.thunk_acks.remove(&thunk_id) {
                    let _ = reply.send(match error {
                        Some(e) => Err(e),
                        None => Ok(()),
                    });
                }
            }
            WireMsg::ThunkDone { thunk_id, error, .. } => {
                if let Some(reply) = self.thunk_done.remove(&thunk_id) {
                    let _ = reply.send(ThunkOutcome { error });
                }
            }
            WireMsg::ThunkState { active } => {
                debug!(active = active.len(), "thunk graph snapshot");
            }
            WireMsg::StateReply { request_id, version, slice } => {
                if let Some(PendingQuery::State(reply)) = self.queries.remove(&request_id) {
                    let _ = reply.send((version, slice));
                }
            }
            WireMsg::SubscriptionsReply { request_id, keys } => {
                if let Some(PendingQuery::Subscriptions(reply)) = self.queries.remove(&request_id)
                {
                    let _ = reply.send(keys);
                }
            }
            WireMsg::ThunkStateReply { request_id, active } => {
                if let Some(PendingQuery::Thunks(reply)) = self.queries.remove(&request_id) {
                    let _ = reply.send(active);
                }
            }
            other => {
                warn!(msg = ?other, "view received a hub-bound message");
            }
        }
        Ok(())
    }

    async fn flush_batch(&mut self) -> Result<()> {
        if let Some(batch) = self.batcher.take() {
            self.send_batch(batch).await?;
        }
        Ok(())
    }

    async fn send_batch(&mut self, mut batch: Vec<Action>) -> Result<()> {
        debug!(len = batch.len(), "sending dispatch batch");
        if batch.len() == 1 {
            let action = batch.remove(0);
            self.send_msg(WireMsg::Dispatch { action }).await
        } else {
            self.send_msg(WireMsg::DispatchBatch { actions: batch }).await
        }
    }

    async fn send_msg(&mut self, msg: WireMsg) -> Result<()> {
        let envelope = self.seq.stamp(msg);
        self.port_tx.send(envelope).await
    }

    fn teardown(&mut self) {
        let error = disconnected();
        self.pending.reject_all(&error);
        self.thunk_acks.clear();
        self.thunk_done.clear();
        self.queries.clear();
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
