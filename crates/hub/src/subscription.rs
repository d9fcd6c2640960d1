// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-view key subscriptions and state slicing.
//!
//! Every connected view is subscribed to the wildcard until it narrows
//! itself. Subscription changes happen on the hub task between state
//! updates, so a view either sees a change applied before update N or it
//! does not — never both.

use indexmap::IndexSet;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use statemux_wire::action::{Action, ViewId};
use statemux_wire::envelope::SubscriptionSpec;
use statemux_wire::error::{EngineError, Result};

/// What one view receives: everything, or a finite set of top-level keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    All,
    Keys(IndexSet<String>),
}

impl Subscription {
    fn spec(&self) -> SubscriptionSpec {
        match self {
            Self::All => SubscriptionSpec::All,
            Self::Keys(keys) => SubscriptionSpec::Keys(keys.iter().cloned().collect()),
        }
    }
}

/// Tracks subscriptions for every connected view and computes slices.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    views: indexmap::IndexMap<ViewId, Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A newly connected view starts on the wildcard.
    pub fn connect(&mut self, view_id: ViewId) {
        self.views.insert(view_id, Subscription::All);
    }

    pub fn disconnect(&mut self, view_id: ViewId) {
        self.views.shift_remove(&view_id);
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.views.keys().copied()
    }

    pub fn is_connected(&self, view_id: ViewId) -> bool {
        self.views.contains_key(&view_id)
    }

    /// Apply a subscribe control action.
    ///
    /// The wildcard replaces everything; a key set replaces a wildcard
    /// (the only way a view can narrow itself) and merges into an
    /// existing key set.
    pub fn subscribe(&mut self, view_id: ViewId, spec: SubscriptionSpec) {
        let Some(current) = self.views.get_mut(&view_id) else {
            warn!(view_id, "subscribe from unknown view");
            return;
        };
        match spec {
            SubscriptionSpec::All => *current = Subscription::All,
            SubscriptionSpec::Keys(keys) => match current {
                Subscription::All => {
                    *current = Subscription::Keys(keys.into_iter().collect());
                }
                Subscription::Keys(existing) => existing.extend(keys),
            },
        }
        debug!(view_id, "subscription updated");
    }

    /// Remove keys from a view's subscription. Removing from the wildcard
    /// is a no-op: there is no finite set to subtract from.
    pub fn unsubscribe(&mut self, view_id: ViewId, keys: &[String]) {
        let Some(current) = self.views.get_mut(&view_id) else {
            warn!(view_id, "unsubscribe from unknown view");
            return;
        };
        match current {
            Subscription::All => {
                warn!(view_id, "unsubscribe ignored for wildcard subscription");
            }
            Subscription::Keys(existing) => {
                for key in keys {
                    existing.shift_remove(key);
                }
            }
        }
    }

    /// The view's current subscription, as it crosses the wire.
    pub fn current(&self, view_id: ViewId) -> SubscriptionSpec {
        self.views.get(&view_id).map(Subscription::spec).unwrap_or(SubscriptionSpec::All)
    }

    /// Project the full state through one view's subscription.
    pub fn slice(&self, view_id: ViewId, state: &Value) -> Value {
        match self.views.get(&view_id) {
            None | Some(Subscription::All) => state.clone(),
            Some(Subscription::Keys(keys)) => {
                let mut out = Map::new();
                if let Some(full) = state.as_object() {
                    for key in keys {
                        if let Some(v) = full.get(key) {
                            out.insert(key.clone(), v.clone());
                        }
                    }
                }
                Value::Object(out)
            }
        }
    }

    /// Access control: an action whose declared keys are disjoint from the
    /// source view's subscription is rejected before it reaches the
    /// scheduler, unless it carries the bypass flag.
    pub fn check_access(&self, view_id: ViewId, action: &Action) -> Result<()> {
        if action.bypass_access_control {
            return Ok(());
        }
        let Some(keys) = action.keys.as_deref() else {
            return Ok(()); // nothing declared, nothing to check
        };
        match self.views.get(&view_id) {
            None | Some(Subscription::All) => Ok(()),
            Some(Subscription::Keys(subscribed)) => {
                if keys.iter().any(|k| subscribed.contains(k)) {
                    Ok(())
                } else {
                    Err(EngineError::subscription(format!(
                        "action {:?} touches keys outside the view subscription",
                        action.action_type
                    ))
                    .with_action(action.id)
                    .with_view(view_id))
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
