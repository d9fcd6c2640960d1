// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire messages exchanged between the hub and its views.
//!
//! Every IPC payload is a tagged envelope `{ seq, kind, body }`. Sequence
//! numbers are per direction and strictly monotonic from 1; the transport
//! is trusted to preserve message boundaries and FIFO order, so a gap in
//! the sequence indicates a protocol bug rather than reordering.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{Action, ActionId, RequestId, ThunkId, UpdateId, ViewId};
use crate::error::EngineError;

/// One IPC message: a direction-scoped sequence number plus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(flatten)]
    pub msg: WireMsg,
}

/// The four message families of the boundary, as one tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum WireMsg {
    // dispatch family (view -> hub, acks hub -> view)
    Dispatch {
        action: Action,
    },
    DispatchBatch {
        actions: Vec<Action>,
    },
    DispatchAck {
        action_id: ActionId,
        /// State version after the action was applied (0 when rejected).
        version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<EngineError>,
    },

    // thunk control family (bidirectional)
    RegisterThunk {
        thunk_id: ThunkId,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<ThunkId>,
        #[serde(default)]
        bypass_thunk_lock: bool,
        #[serde(default)]
        bypass_access_control: bool,
    },
    RegisterThunkAck {
        thunk_id: ThunkId,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<EngineError>,
    },
    CompleteThunk {
        thunk_id: ThunkId,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<EngineError>,
    },
    /// Hub -> registering view: the thunk tree has fully drained.
    ThunkDone {
        thunk_id: ThunkId,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<EngineError>,
    },
    /// Compact snapshot of the active thunk graph, broadcast on lifecycle
    /// changes.
    ThunkState {
        active: Vec<ThunkSummary>,
    },

    // state propagation family (hub <-> view)
    StateUpdate {
        update_id: UpdateId,
        version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        originating_thunk_id: Option<ThunkId>,
        slice: Value,
    },
    StateUpdateAck {
        update_id: UpdateId,
    },

    // subscription control (view -> hub, no reply)
    Subscribe {
        keys: SubscriptionSpec,
    },
    Unsubscribe {
        keys: Vec<String>,
    },

    // administrative request/reply (view -> hub)
    GetState {
        request_id: RequestId,
    },
    StateReply {
        request_id: RequestId,
        version: u64,
        slice: Value,
    },
    #[serde(rename = "get-window-subscriptions")]
    GetSubscriptions {
        request_id: RequestId,
    },
    SubscriptionsReply {
        request_id: RequestId,
        keys: SubscriptionSpec,
    },
    GetThunkState {
        request_id: RequestId,
    },
    ThunkStateReply {
        request_id: RequestId,
        active: Vec<ThunkSummary>,
    },
}

/// Thunk lifecycle phase. Transitions are monotonic:
/// pending -> executing -> (completed | failed), with the single exception
/// of pending -> failed on registration refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThunkPhase {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ThunkPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One entry of the broadcast thunk-state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThunkSummary {
    pub id: ThunkId,
    pub source_view_id: ViewId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ThunkId>,
    pub phase: ThunkPhase,
}

/// What a view is subscribed to: everything, or a finite set of top-level
/// keys. Serialises as the literal string `"*"` or a key array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSpec {
    All,
    Keys(Vec<String>),
}

impl SubscriptionSpec {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }
}

impl Serialize for SubscriptionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("*"),
            Self::Keys(keys) => keys.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SubscriptionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SpecVisitor;

        impl<'de> Visitor<'de> for SpecVisitor {
            type Value = SubscriptionSpec;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("\"*\" or an array of key strings")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "*" {
                    Ok(SubscriptionSpec::All)
                } else {
                    Err(E::custom(format!("expected \"*\", got {v:?}")))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut keys = Vec::new();
                while let Some(key) = seq.next_element::<String>()? {
                    keys.push(key);
                }
                Ok(SubscriptionSpec::Keys(keys))
            }
        }

        deserializer.deserialize_any(SpecVisitor)
    }
}

/// Per-direction sequence bookkeeping.
///
/// Each side stamps outgoing envelopes from its own counter and verifies
/// that incoming envelopes arrive in order.
#[derive(Debug)]
pub struct Sequencer {
    next_out: u64,
    expected_in: u64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next_out: 1, expected_in: 1 }
    }

    /// Wrap a message in the next outgoing envelope.
    pub fn stamp(&mut self, msg: WireMsg) -> Envelope {
        let seq = self.next_out;
        self.next_out += 1;
        Envelope { seq, msg }
    }

    /// Check an incoming envelope against the expected sequence.
    ///
    /// Returns the gap size (0 = in order). The expected counter always
    /// advances past the observed seq so a single fault does not cascade.
    pub fn check(&mut self, envelope: &Envelope) -> u64 {
        let gap = envelope.seq.abs_diff(self.expected_in);
        self.expected_in = envelope.seq + 1;
        gap
    }
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
