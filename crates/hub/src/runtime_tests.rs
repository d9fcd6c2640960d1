// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use statemux_wire::action::Action;
use statemux_wire::config::EngineConfig;
use statemux_wire::envelope::{Sequencer, SubscriptionSpec, WireMsg};
use statemux_wire::error::ErrorKind;
use statemux_wire::transport::{port_pair, MessagePort};

use super::*;
use crate::store::HandlerStore;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_store() -> HandlerStore {
    HandlerStore::new(json!({"counter": 0, "theme": "light"}))
        .expect("object state")
        .handle("COUNTER:INCREMENT", |state, _| {
            let n = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
            state.insert("counter".to_owned(), json!(n + 1));
            Ok(true)
        })
        .handle("THEME:TOGGLE", |state, _| {
            let next = match state.get("theme").and_then(Value::as_str) {
                Some("light") => "dark",
                _ => "light",
            };
            state.insert("theme".to_owned(), json!(next));
            Ok(true)
        })
        .handle("BOOM", |_, _| {
            Err(statemux_wire::error::EngineError::action("handler blew up"))
        })
}

async fn start_hub(config: EngineConfig) -> (Hub, HubHandle) {
    let hub = Hub::spawn(test_store(), config).expect("spawn");
    let handle = hub.handle();
    (hub, handle)
}

// ===== TestView ==============================================================

/// Wire-level fake view: speaks raw envelopes to the hub.
struct TestView {
    port: MessagePort,
    seq: Sequencer,
}

impl TestView {
    async fn connect(handle: &HubHandle) -> Self {
        let (hub_end, view_end) = port_pair(64);
        handle.connect_view(hub_end).await.expect("connect");
        let mut view = Self { port: view_end, seq: Sequencer::new() };
        // Swallow and acknowledge the initial state snapshot.
        let (_, _, _) = view.expect_update().await;
        view
    }

    async fn send(&mut self, msg: WireMsg) {
        let envelope = self.seq.stamp(msg);
        self.port.send(envelope).await.expect("send to hub");
    }

    async fn recv(&mut self) -> WireMsg {
        let envelope = tokio::time::timeout(RECV_TIMEOUT, self.port.recv())
            .await
            .expect("timed out waiting for the hub")
            .expect("hub closed the port");
        envelope.msg
    }

    /// Receive a state update (skipping thunk-state broadcasts) and
    /// acknowledge it. Returns (version, slice, update_id).
    async fn expect_update(&mut self) -> (u64, Value, Uuid) {
        loop {
            match self.recv().await {
                WireMsg::StateUpdate { update_id, version, slice, .. } => {
                    self.send(WireMsg::StateUpdateAck { update_id }).await;
                    return (version, slice, update_id);
                }
                WireMsg::ThunkState { .. } => continue,
                other => panic!("expected a state update, got {other:?}"),
            }
        }
    }

    /// Receive a dispatch ack (skipping thunk-state broadcasts).
    async fn expect_ack(&mut self) -> (Uuid, u64, Option<statemux_wire::error::EngineError>) {
        loop {
            match self.recv().await {
                WireMsg::DispatchAck { action_id, version, error } => {
                    return (action_id, version, error);
                }
                WireMsg::ThunkState { .. } => continue,
                other => panic!("expected a dispatch ack, got {other:?}"),
            }
        }
    }

    async fn expect_thunk_done(&mut self) -> (Uuid, Option<Value>, Option<statemux_wire::error::EngineError>) {
        loop {
            match self.recv().await {
                WireMsg::ThunkDone { thunk_id, result, error } => return (thunk_id, result, error),
                WireMsg::ThunkState { .. } => continue,
                other => panic!("expected thunk-done, got {other:?}"),
            }
        }
    }

    /// Register a root thunk and wait for its acknowledgement.
    async fn register_thunk(&mut self, thunk_id: Uuid) {
        self.send(WireMsg::RegisterThunk {
            thunk_id,
            parent_id: None,
            bypass_thunk_lock: false,
            bypass_access_control: false,
        })
        .await;
        loop {
            match self.recv().await {
                WireMsg::RegisterThunkAck { error, .. } => {
                    assert!(error.is_none(), "registration refused: {error:?}");
                    return;
                }
                WireMsg::ThunkState { .. } => continue,
                other => panic!("expected register ack, got {other:?}"),
            }
        }
    }

    /// Assert nothing but thunk-state chatter arrives for a while.
    async fn expect_silence(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.port.recv()).await {
                Err(_) => return, // window elapsed
                Ok(Some(env)) => match env.msg {
                    WireMsg::ThunkState { .. } => continue,
                    other => panic!("expected silence, got {other:?}"),
                },
                Ok(None) => panic!("hub closed the port"),
            }
        }
    }
}

// ===== Basic dispatch ========================================================

#[tokio::test]
async fn connect_sends_the_initial_state() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let (hub_end, mut view_end) = port_pair(64);
    handle.connect_view(hub_end).await.expect("connect");

    let envelope = tokio::time::timeout(RECV_TIMEOUT, view_end.recv())
        .await
        .expect("timeout")
        .expect("closed");
    assert_eq!(envelope.seq, 1);
    match envelope.msg {
        WireMsg::StateUpdate { version, slice, .. } => {
            assert_eq!(version, 1);
            assert_eq!(slice, json!({"counter": 0, "theme": "light"}));
        }
        other => panic!("expected the initial state update, got {other:?}"),
    }
    hub.destroy().await;
}

#[tokio::test]
async fn dispatch_sends_update_before_ack() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    let action = Action::new("COUNTER:INCREMENT");
    let action_id = action.id;
    view.send(WireMsg::Dispatch { action }).await;

    // The state update for version 2 arrives strictly before the ack.
    let (version, slice, _) = view.expect_update().await;
    assert_eq!(version, 2);
    assert_eq!(slice["counter"], 1);

    let (acked, ack_version, error) = view.expect_ack().await;
    assert_eq!(acked, action_id);
    assert_eq!(ack_version, 2);
    assert!(error.is_none());
    hub.destroy().await;
}

#[tokio::test]
async fn unknown_action_type_is_rejected() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    view.send(WireMsg::Dispatch { action: Action::new("NOPE") }).await;
    let (_, version, error) = view.expect_ack().await;
    assert_eq!(version, 0);
    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::HandlerResolution));
    hub.destroy().await;
}

#[tokio::test]
async fn processor_errors_do_not_poison_the_hub() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    view.send(WireMsg::Dispatch { action: Action::new("BOOM") }).await;
    let (_, _, error) = view.expect_ack().await;
    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::ActionProcessing));

    view.send(WireMsg::Dispatch { action: Action::new("COUNTER:INCREMENT") }).await;
    let (version, slice, _) = view.expect_update().await;
    assert_eq!(version, 2);
    assert_eq!(slice["counter"], 1);
    view.expect_ack().await;
    hub.destroy().await;
}

#[tokio::test]
async fn batch_dispatch_preserves_order() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    let actions: Vec<Action> =
        (0..3).map(|_| Action::new("COUNTER:INCREMENT")).collect();
    let ids: Vec<Uuid> = actions.iter().map(|a| a.id).collect();
    view.send(WireMsg::DispatchBatch { actions }).await;

    for (i, &id) in ids.iter().enumerate() {
        let (version, slice, _) = view.expect_update().await;
        assert_eq!(version, 2 + i as u64);
        assert_eq!(slice["counter"], 1 + i as i64);
        let (acked, _, _) = view.expect_ack().await;
        assert_eq!(acked, id);
    }
    hub.destroy().await;
}

// ===== Subscriptions =========================================================

#[tokio::test]
async fn slices_follow_the_subscription() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    view.send(WireMsg::Subscribe { keys: SubscriptionSpec::keys(["counter"]) }).await;
    view.send(WireMsg::Dispatch { action: Action::new("THEME:TOGGLE") }).await;

    let (version, slice, _) = view.expect_update().await;
    assert_eq!(version, 2);
    assert_eq!(slice, json!({"counter": 0}));
    view.expect_ack().await;
    hub.destroy().await;
}

#[tokio::test]
async fn access_control_blocks_disjoint_dispatch() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    view.send(WireMsg::Subscribe { keys: SubscriptionSpec::keys(["counter"]) }).await;
    view.send(WireMsg::Dispatch {
        action: Action::new("THEME:TOGGLE").with_keys(["theme"]),
    })
    .await;

    let (_, version, error) = view.expect_ack().await;
    assert_eq!(version, 0);
    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::Subscription));

    // The bypass flag skips the check.
    view.send(WireMsg::Dispatch {
        action: Action::new("THEME:TOGGLE").with_keys(["theme"]).bypassing_access_control(),
    })
    .await;
    let (version, _, _) = view.expect_update().await;
    assert_eq!(version, 2);
    view.expect_ack().await;
    hub.destroy().await;
}

#[tokio::test]
async fn admin_queries_reply_in_kind() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut view = TestView::connect(&handle).await;

    let request_id = Uuid::new_v4();
    view.send(WireMsg::GetState { request_id }).await;
    match view.recv().await {
        WireMsg::StateReply { request_id: rid, version, slice } => {
            assert_eq!(rid, request_id);
            assert_eq!(version, 1);
            assert_eq!(slice["counter"], 0);
        }
        other => panic!("expected state reply, got {other:?}"),
    }

    view.send(WireMsg::Subscribe { keys: SubscriptionSpec::keys(["theme"]) }).await;
    let request_id = Uuid::new_v4();
    view.send(WireMsg::GetSubscriptions { request_id }).await;
    match view.recv().await {
        WireMsg::SubscriptionsReply { request_id: rid, keys } => {
            assert_eq!(rid, request_id);
            assert_eq!(keys, SubscriptionSpec::keys(["theme"]));
        }
        other => panic!("expected subscriptions reply, got {other:?}"),
    }
    hub.destroy().await;
}

// ===== Thunks over the wire ==================================================

#[tokio::test]
async fn thunk_tree_excludes_foreign_actions_until_complete() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut a = TestView::connect(&handle).await;
    let mut b = TestView::connect(&handle).await;

    // A registers a thunk and dispatches under it.
    let thunk_id = Uuid::new_v4();
    a.register_thunk(thunk_id).await;

    a.send(WireMsg::Dispatch {
        action: Action::new("COUNTER:INCREMENT").with_parent(thunk_id),
    })
    .await;
    let (version, _, _) = a.expect_update().await;
    assert_eq!(version, 2);
    a.expect_ack().await;
    // B observes the thunk's update too (and must ack it).
    let (version, _, _) = b.expect_update().await;
    assert_eq!(version, 2);

    // B's own dispatch is deferred while the tree holds the lock.
    let foreign = Action::new("COUNTER:INCREMENT");
    let foreign_id = foreign.id;
    b.send(WireMsg::Dispatch { action: foreign }).await;
    b.expect_silence(Duration::from_millis(150)).await;

    // Root completes; B's action finally runs.
    a.send(WireMsg::CompleteThunk { thunk_id, result: Some(json!("done")), error: None }).await;
    let (done_id, result, error) = a.expect_thunk_done().await;
    assert_eq!(done_id, thunk_id);
    assert_eq!(result, Some(json!("done")));
    assert!(error.is_none());

    let (version, slice, _) = b.expect_update().await;
    assert_eq!(version, 3);
    assert_eq!(slice["counter"], 2);
    let (acked, ack_version, _) = b.expect_ack().await;
    assert_eq!(acked, foreign_id);
    assert_eq!(ack_version, 3);
    hub.destroy().await;
}

#[tokio::test]
async fn queue_overflow_rejects_with_resource_error() {
    let config = EngineConfig { max_queue_size: 2, ..EngineConfig::default() };
    let (hub, handle) = start_hub(config).await;
    let mut a = TestView::connect(&handle).await;
    let mut b = TestView::connect(&handle).await;

    // Hold the lock so B's dispatches pile up.
    let thunk_id = Uuid::new_v4();
    a.register_thunk(thunk_id).await;
    a.send(WireMsg::Dispatch {
        action: Action::new("COUNTER:INCREMENT").with_parent(thunk_id),
    })
    .await;
    a.expect_update().await;
    b.expect_update().await;

    for _ in 0..2 {
        b.send(WireMsg::Dispatch { action: Action::new("COUNTER:INCREMENT") }).await;
    }
    let overflow = Action::new("COUNTER:INCREMENT");
    b.send(WireMsg::Dispatch { action: overflow }).await;

    let (_, version, error) = b.expect_ack().await;
    assert_eq!(version, 0);
    assert_eq!(error.map(|e| e.kind), Some(ErrorKind::ResourceManagement));
    hub.destroy().await;
}

#[tokio::test]
async fn dead_view_counts_as_universal_acker() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let mut a = TestView::connect(&handle).await;
    let mut b = TestView::connect(&handle).await;

    let thunk_id = Uuid::new_v4();
    a.register_thunk(thunk_id).await;
    a.send(WireMsg::Dispatch {
        action: Action::new("COUNTER:INCREMENT").with_parent(thunk_id),
    })
    .await;
    a.expect_update().await;
    a.expect_ack().await;
    a.send(WireMsg::CompleteThunk { thunk_id, result: None, error: None }).await;

    // B received the update but never acks it — the thunk stays open.
    loop {
        match b.recv().await {
            WireMsg::StateUpdate { version, .. } => {
                assert_eq!(version, 2);
                break;
            }
            WireMsg::ThunkState { .. } => continue,
            other => panic!("expected a state update, got {other:?}"),
        }
    }
    a.expect_silence(Duration::from_millis(150)).await;

    // B dies; its missing ack is forgiven and the thunk fully completes.
    drop(b);
    let (done_id, _, error) = a.expect_thunk_done().await;
    assert_eq!(done_id, thunk_id);
    assert!(error.is_none());
    hub.destroy().await;
}

#[tokio::test]
async fn destroy_rejects_pending_work() {
    let (hub, handle) = start_hub(EngineConfig::default()).await;
    let view = TestView::connect(&handle).await;

    hub.destroy().await;
    // The hub is gone: further handle calls fail cleanly.
    let err = handle.state().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Ipc);
    drop(view);
}
