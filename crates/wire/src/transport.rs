// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory message ports.
//!
//! The desktop host supplies the real inter-process channel; the engine
//! only assumes it preserves message boundaries and FIFO order per
//! direction. `port_pair` provides that contract over bounded in-process
//! channels — it is the transport used by same-process hosts and the
//! test suites. A host bridging to native IPC pumps envelopes between its
//! channel and a `MessagePort` end.

use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::{EngineError, Result};

/// Sending half of a message port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::Sender<Envelope>,
}

impl PortSender {
    /// Deliver one envelope to the peer. Fails when the peer is gone.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| EngineError::ipc("peer disconnected").with_channel("port"))
    }

    /// Deliver one envelope without waiting. Fails when the peer is gone
    /// or its channel is full — a receiver that stopped draining is
    /// indistinguishable from a dead one.
    pub fn try_send(&self, envelope: Envelope) -> Result<()> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::ipc("peer not draining").with_channel("port")
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::ipc("peer disconnected").with_channel("port")
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a message port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl PortReceiver {
    /// Receive the next envelope, or `None` once the peer is gone and the
    /// channel has drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// One end of a bidirectional, order-preserving message channel.
#[derive(Debug)]
pub struct MessagePort {
    tx: PortSender,
    rx: PortReceiver,
}

impl MessagePort {
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).await
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (PortSender, PortReceiver) {
        (self.tx, self.rx)
    }
}

/// Create two connected ports with the given per-direction capacity.
pub fn port_pair(capacity: usize) -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MessagePort { tx: PortSender { tx: a_tx }, rx: PortReceiver { rx: a_rx } },
        MessagePort { tx: PortSender { tx: b_tx }, rx: PortReceiver { rx: b_rx } },
    )
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
