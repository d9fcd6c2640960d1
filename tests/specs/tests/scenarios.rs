// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: real hub, real view runtimes, in-memory ports.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use statemux_specs::Harness;
use statemux_view::dispatcher::thunk;
use statemux_wire::action::Action;
use statemux_wire::config::EngineConfig;
use statemux_wire::envelope::SubscriptionSpec;
use statemux_wire::error::ErrorKind;

fn counter(state: &Value) -> i64 {
    state["counter"].as_i64().unwrap_or(i64::MIN)
}

// ===== Seeded scenarios ======================================================

/// A view-originated thunk doubles, doubles, halves. The observed counter
/// sequence is 2, 4, 8, 4 and the thunk resolves with the final state.
#[tokio::test]
async fn sequential_doubling_thunk() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 2}))?;
    let recorder = harness.recorder().await?;
    let view = harness.view().await?;

    let state = view
        .dispatch(thunk(|h| async move {
            for factor in [2, 2] {
                let doubled = counter(&h.state()) * factor;
                h.dispatch(("COUNTER:SET", json!(doubled))).await?;
            }
            let halved = counter(&h.state()) / 2;
            h.dispatch(("COUNTER:SET", json!(halved))).await?;
            Ok(json!(null))
        }))
        .await?;

    assert_eq!(state, json!({"counter": 4}));
    assert_eq!(recorder.counters(), vec![2, 4, 8, 4]);
    assert_eq!(recorder.versions(), vec![1, 2, 3, 4]);
    harness.destroy().await;
    Ok(())
}

/// An unrelated dispatch from the same view, issued mid-thunk, is applied
/// only after the thunk tree completes.
#[tokio::test]
async fn same_window_interleave() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 2}))?;
    let recorder = harness.recorder().await?;
    let view = harness.view().await?;

    let doubling = view.dispatch(thunk(|h| async move {
        for factor in [2, 2] {
            let doubled = counter(&h.state()) * factor;
            h.dispatch(("COUNTER:SET", json!(doubled))).await?;
        }
        let halved = counter(&h.state()) / 2;
        h.dispatch(("COUNTER:SET", json!(halved))).await?;
        Ok(json!(null))
    }));

    let interleaved = async {
        // Wait until the first thunk action landed (counter = 4)…
        view.wait_for_version(2).await;
        // …then dispatch. The increment defers until the tree completes.
        view.dispatch("COUNTER:INCREMENT").await
    };

    let (thunk_state, increment_state) = tokio::join!(doubling, interleaved);
    thunk_state?;
    assert_eq!(increment_state?, json!({"counter": 5}));
    recorder.wait_for_count(5).await;
    assert_eq!(recorder.counters(), vec![2, 4, 8, 4, 5]);
    harness.destroy().await;
    Ok(())
}

/// Two thunk trees from different views never interleave: the second
/// tree's first action waits for the first root to complete.
#[tokio::test]
async fn cross_tree_lock() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 0}))?;
    let recorder = harness.recorder().await?;
    let view_a = harness.view().await?;
    let view_b = harness.view().await?;

    let slow = view_a.dispatch(thunk(|h| async move {
        h.dispatch(("COUNTER:SET", json!(1))).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.dispatch(("COUNTER:SET", json!(2))).await?;
        Ok(json!(null))
    }));

    let late = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        view_b
            .dispatch(thunk(|h| async move {
                h.dispatch(("COUNTER:SET", json!(99))).await?;
                Ok(json!(null))
            }))
            .await
    };

    let (slow_result, late_result) = tokio::join!(slow, late);
    slow_result?;
    late_result?;

    // B's action ran strictly after both of A's.
    assert_eq!(recorder.counters(), vec![0, 1, 2, 99]);
    harness.destroy().await;
    Ok(())
}

/// An action declaring keys disjoint from a slow thunk's keys is not
/// deferred behind the lock.
#[tokio::test]
async fn non_overlapping_keys_fast_path() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 2, "theme": "light"}))?;
    let recorder = harness.recorder().await?;
    let view_a = harness.view().await?;
    let view_b = harness.view().await?;

    let slow = view_a.dispatch(thunk(|h| async move {
        h.dispatch(Action::new("COUNTER:SET").with_payload(json!(3)).with_keys(["counter"]))
            .await?;
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.dispatch(Action::new("COUNTER:SET").with_payload(json!(4)).with_keys(["counter"]))
            .await?;
        Ok(json!(null))
    }));

    let toggle = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let state = view_b
            .dispatch(Action::new("THEME:TOGGLE").with_keys(["theme"]))
            .await?;
        anyhow::Ok((started.elapsed(), state))
    };

    let (slow_result, toggle_result) = tokio::join!(slow, toggle);
    let final_state = slow_result?;
    let (elapsed, toggled) = toggle_result?;

    // The toggle was not held behind the 400 ms suspension: it landed
    // between the thunk's two writes.
    assert!(elapsed < Duration::from_secs(1), "toggle deferred for {elapsed:?}");
    assert_eq!(toggled["theme"], "dark");
    assert_eq!(counter(&final_state), 4);
    assert_eq!(recorder.counters(), vec![2, 3, 3, 4]);
    harness.destroy().await;
    Ok(())
}

/// A nested thunk chains parentage, shares the outer root, and the outer
/// promise resolves only after the inner tree is fully complete.
#[tokio::test]
async fn nested_thunks() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 1}))?;
    let view = harness.view().await?;
    let observer = view.clone();

    let state = view
        .dispatch(thunk(move |outer| async move {
            outer.dispatch(("COUNTER:SET", json!(10))).await?;

            let outer_id = outer.thunk_id();
            outer
                .dispatch(thunk(move |inner| async move {
                    // Both thunks are active and the inner one hangs off
                    // the outer root.
                    let active = observer.thunk_state().await?;
                    assert_eq!(active.len(), 2);
                    let entry = active
                        .iter()
                        .find(|s| s.id == inner.thunk_id())
                        .ok_or_else(|| {
                            statemux_wire::error::EngineError::thunk("inner not in snapshot")
                        })?;
                    assert_eq!(entry.parent_id, Some(outer_id));

                    inner.dispatch(("COUNTER:SET", json!(20))).await?;
                    Ok(json!(null))
                }))
                .await?;

            Ok(json!(null))
        }))
        .await?;

    assert_eq!(counter(&state), 20);
    // Everything drained: no active thunks remain.
    assert!(view.thunk_state().await?.is_empty());
    harness.destroy().await;
    Ok(())
}

/// Twenty synchronous dispatches coalesce into a handful of batches and
/// all twenty still apply.
#[tokio::test]
async fn batching_reduction() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 0}))?;
    let (view, dispatch_messages) = harness.view_with_tap(EngineConfig::default()).await?;

    let bursts: Vec<_> = (0..20).map(|_| view.dispatch("COUNTER:INCREMENT")).collect();
    for result in futures_util::future::join_all(bursts).await {
        result?;
    }

    let messages = dispatch_messages.load(std::sync::atomic::Ordering::SeqCst);
    assert!(messages <= 5, "expected at most 5 dispatch messages, saw {messages}");
    assert_eq!(counter(&view.state()), 20);
    harness.destroy().await;
    Ok(())
}

// ===== Boundary behaviours ===================================================

/// A view narrowed to `theme` only ever receives theme-shaped slices.
#[tokio::test]
async fn slices_stay_inside_the_subscription() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 0, "theme": "light"}))?;
    let narrow = harness.view().await?;
    let other = harness.view().await?;

    narrow.subscribe(SubscriptionSpec::keys(["theme"])).await?;
    narrow.current_subscriptions().await?; // barrier: subscribe applied

    other.dispatch("COUNTER:INCREMENT").await?;
    other.dispatch("THEME:TOGGLE").await?;
    narrow.wait_for_version(3).await;

    assert_eq!(narrow.state(), json!({"theme": "dark"}));
    harness.destroy().await;
    Ok(())
}

/// Identical dispatches with distinct ids each execute exactly once.
#[tokio::test]
async fn duplicate_dispatches_execute_independently() -> anyhow::Result<()> {
    let harness = Harness::start(json!({"counter": 0}))?;
    let view = harness.view().await?;

    let first = view.dispatch("COUNTER:INCREMENT").await?;
    let second = view.dispatch("COUNTER:INCREMENT").await?;
    assert_eq!(counter(&first), 1);
    assert_eq!(counter(&second), 2);
    harness.destroy().await;
    Ok(())
}

/// The queue bound rejects the overflowing dispatch with a
/// resource-management error while earlier entries survive.
#[tokio::test]
async fn queue_overflow_is_a_resource_error() -> anyhow::Result<()> {
    let config = EngineConfig { max_queue_size: 2, ..EngineConfig::default() };
    let harness = Harness::start_with(json!({"counter": 0}), config)?;
    let view_a = harness.view().await?;
    let view_b = harness.view().await?;

    // Hold the lock with a slow thunk so foreign dispatches pile up.
    let slow = view_a.dispatch(thunk(|h| async move {
        h.dispatch(("COUNTER:SET", json!(1))).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!(null))
    }));

    let flood = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Spawned so the dispatches are in flight while the lock is held.
        let deferred: Vec<_> = (0..2)
            .map(|_| {
                let view = view_b.clone();
                tokio::spawn(async move { view.dispatch("COUNTER:INCREMENT").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let overflow = view_b.dispatch("COUNTER:INCREMENT").await;
        (deferred, overflow)
    };

    let (slow_result, (deferred, overflow)) = tokio::join!(slow, flood);
    slow_result?;

    let err = overflow.expect_err("queue was full");
    assert_eq!(err.kind, ErrorKind::ResourceManagement);
    // The two queued increments still ran after the lock released.
    for result in futures_util::future::join_all(deferred).await {
        result??;
    }
    assert_eq!(counter(&view_b.state()), 3);
    harness.destroy().await;
    Ok(())
}
