// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end engine scenarios.
//!
//! Assembles a real hub and real view runtimes over in-memory ports, with
//! a counter/theme store fixture, an update recorder for asserting
//! observed version sequences, and a tap that counts dispatch traffic on
//! the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use serde_json::{json, Value};

use statemux_hub::runtime::{Hub, HubHandle};
use statemux_hub::store::HandlerStore;
use statemux_view::dispatcher::ViewDispatcher;
use statemux_wire::config::EngineConfig;
use statemux_wire::envelope::{Sequencer, WireMsg};
use statemux_wire::transport::{port_pair, MessagePort};

static LOG_INIT: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`. Safe to call from
/// every test — only the first call has effect.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// The store used by every scenario: a counter and a theme flag.
pub fn fixture_store(initial: Value) -> anyhow::Result<HandlerStore> {
    let store = HandlerStore::new(initial)?
        .handle("COUNTER:INCREMENT", |state, _| {
            let n = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
            state.insert("counter".to_owned(), json!(n + 1));
            Ok(true)
        })
        .handle("COUNTER:SET", |state, action| {
            let value = action.payload.clone().unwrap_or(Value::Null);
            let changed = state.get("counter") != Some(&value);
            state.insert("counter".to_owned(), value);
            Ok(changed)
        })
        .handle("THEME:TOGGLE", |state, _| {
            let next = match state.get("theme").and_then(Value::as_str) {
                Some("light") => "dark",
                _ => "light",
            };
            state.insert("theme".to_owned(), json!(next));
            Ok(true)
        });
    Ok(store)
}

/// One hub plus however many views a scenario needs.
pub struct Harness {
    hub: Hub,
}

impl Harness {
    pub fn start(initial: Value) -> anyhow::Result<Self> {
        Self::start_with(initial, EngineConfig::default())
    }

    pub fn start_with(initial: Value, config: EngineConfig) -> anyhow::Result<Self> {
        init_logging();
        let hub = Hub::spawn(fixture_store(initial)?, config)?;
        Ok(Self { hub })
    }

    pub fn handle(&self) -> HubHandle {
        self.hub.handle()
    }

    /// Connect a fresh view and wait for its initial snapshot.
    pub async fn view(&self) -> anyhow::Result<ViewDispatcher> {
        self.view_with(EngineConfig::default()).await
    }

    pub async fn view_with(&self, config: EngineConfig) -> anyhow::Result<ViewDispatcher> {
        let (hub_end, view_end) = port_pair(256);
        self.hub.handle().connect_view(hub_end).await?;
        let dispatcher = ViewDispatcher::connect(view_end, config)?;
        dispatcher.wait_for_version(1).await;
        Ok(dispatcher)
    }

    /// Connect a view through a wire tap that counts view-to-hub dispatch
    /// messages (single or batch — each counts once).
    pub async fn view_with_tap(
        &self,
        config: EngineConfig,
    ) -> anyhow::Result<(ViewDispatcher, Arc<AtomicUsize>)> {
        let (hub_end, relay_hub_side) = port_pair(256);
        let (relay_view_side, view_end) = port_pair(256);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        tokio::spawn(relay(relay_view_side, relay_hub_side, counter));

        self.hub.handle().connect_view(hub_end).await?;
        let dispatcher = ViewDispatcher::connect(view_end, config)?;
        dispatcher.wait_for_version(1).await;
        Ok((dispatcher, count))
    }

    /// Connect a raw recorder that captures every state update it is sent
    /// (acknowledging each one).
    pub async fn recorder(&self) -> anyhow::Result<Recorder> {
        let (hub_end, port) = port_pair(256);
        self.hub.handle().connect_view(hub_end).await?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&seen);
        tokio::spawn(async move {
            let (tx, mut rx) = port.split();
            let mut seq = Sequencer::new();
            while let Some(envelope) = rx.recv().await {
                if let WireMsg::StateUpdate { update_id, version, slice, .. } = envelope.msg {
                    if let Ok(mut log) = writer.lock() {
                        log.push((version, slice));
                    }
                    let ack = seq.stamp(WireMsg::StateUpdateAck { update_id });
                    if tx.send(ack).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Recorder { seen })
    }

    pub async fn destroy(self) {
        self.hub.destroy().await;
    }
}

/// Transparent bidirectional relay between two ports, counting dispatch
/// messages on the view-to-hub direction.
async fn relay(view_side: MessagePort, hub_side: MessagePort, dispatches: Arc<AtomicUsize>) {
    let (view_tx, mut view_rx) = view_side.split();
    let (hub_tx, mut hub_rx) = hub_side.split();
    loop {
        tokio::select! {
            msg = view_rx.recv() => match msg {
                Some(envelope) => {
                    if matches!(
                        envelope.msg,
                        WireMsg::Dispatch { .. } | WireMsg::DispatchBatch { .. }
                    ) {
                        dispatches.fetch_add(1, Ordering::SeqCst);
                    }
                    if hub_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = hub_rx.recv() => match msg {
                Some(envelope) => {
                    if view_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Captured state updates, in arrival order.
pub struct Recorder {
    seen: Arc<Mutex<Vec<(u64, Value)>>>,
}

impl Recorder {
    pub fn versions(&self) -> Vec<u64> {
        self.seen.lock().map(|log| log.iter().map(|(v, _)| *v).collect()).unwrap_or_default()
    }

    /// The observed `counter` values, one per update.
    pub fn counters(&self) -> Vec<i64> {
        self.seen
            .lock()
            .map(|log| {
                log.iter()
                    .map(|(_, slice)| slice.get("counter").and_then(Value::as_i64).unwrap_or(-1))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait (bounded) until at least `n` updates have been recorded.
    pub async fn wait_for_count(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while self.len() < n && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
