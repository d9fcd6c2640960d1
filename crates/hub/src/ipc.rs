// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The hub's side of the message boundary.
//!
//! One connection record per view: the outbound port half with its
//! sequence counter, plus a reader task pumping inbound envelopes into
//! the hub command stream. Outbound sends never block the hub loop — a
//! view that stopped draining its channel is treated as dead.

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use statemux_wire::action::ViewId;
use statemux_wire::envelope::{Sequencer, WireMsg};
use statemux_wire::error::{EngineError, Result};
use statemux_wire::transport::{MessagePort, PortReceiver, PortSender};

use crate::runtime::HubCmd;

struct Connection {
    tx: PortSender,
    seq: Sequencer,
}

/// Tracks every connected view and owns the outbound half of each port.
pub struct IpcHandler {
    connections: IndexMap<ViewId, Connection>,
    next_view_id: ViewId,
    cmd_tx: mpsc::Sender<HubCmd>,
    shutdown: CancellationToken,
}

impl IpcHandler {
    pub fn new(cmd_tx: mpsc::Sender<HubCmd>, shutdown: CancellationToken) -> Self {
        Self { connections: IndexMap::new(), next_view_id: 1, cmd_tx, shutdown }
    }

    /// Register a new view connection and start its reader task.
    pub fn connect(&mut self, port: MessagePort) -> ViewId {
        let view_id = self.next_view_id;
        self.next_view_id += 1;
        let (tx, rx) = port.split();
        self.connections.insert(view_id, Connection { tx, seq: Sequencer::new() });
        tokio::spawn(pump(view_id, rx, self.cmd_tx.clone(), self.shutdown.child_token()));
        view_id
    }

    pub fn disconnect(&mut self, view_id: ViewId) {
        self.connections.shift_remove(&view_id);
    }

    pub fn is_connected(&self, view_id: ViewId) -> bool {
        self.connections.contains_key(&view_id)
    }

    /// Stamp and send one message to one view.
    pub fn send(&mut self, view_id: ViewId, msg: WireMsg) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&view_id)
            .ok_or_else(|| EngineError::ipc("view is not connected").with_view(view_id))?;
        let envelope = conn.seq.stamp(msg);
        conn.tx.try_send(envelope).map_err(|e| e.with_view(view_id))
    }

    /// Send to every connected view, computing the message per view.
    /// Returns the views whose send failed (to be declared dead).
    pub fn broadcast(&mut self, mut msg_for: impl FnMut(ViewId) -> WireMsg) -> Vec<ViewId> {
        let mut dead = Vec::new();
        for (&view_id, conn) in &mut self.connections {
            let envelope = conn.seq.stamp(msg_for(view_id));
            if conn.tx.try_send(envelope).is_err() {
                dead.push(view_id);
            }
        }
        dead
    }
}

/// Reader task: forwards inbound envelopes to the hub loop, verifying the
/// per-direction sequence, and reports the connection closing.
async fn pump(
    view_id: ViewId,
    mut rx: PortReceiver,
    cmd_tx: mpsc::Sender<HubCmd>,
    shutdown: CancellationToken,
) {
    let mut seq = Sequencer::new();
    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(envelope) => {
                    let gap = seq.check(&envelope);
                    if gap > 0 {
                        warn!(view_id, seq = envelope.seq, gap, "out-of-sequence message from view");
                    }
                    if cmd_tx.send(HubCmd::FromView { view_id, envelope }).await.is_err() {
                        return; // hub gone
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => return,
        }
    }
    debug!(view_id, "view port closed");
    let _ = cmd_tx.send(HubCmd::ViewClosed { view_id }).await;
}
