//! Behaviour every `RunStore` backend must share. Each backend's test file
//! runs these checks against its own store instance.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use runstore::domain::event::{
    BranchPayload, LogLevel, LoopIterationPayload, LoopStartedPayload,
};
use runstore::domain::*;
use runstore::storage::replay::EventFeed;
use runstore::storage::{RunStore, StoreError, Subscription};

const WAIT: Duration = Duration::from_secs(5);

pub fn plan_ab() -> Plan {
    let mut b = NodeSpec::new("B", "task");
    b.inputs = vec!["A".to_string()];
    Plan::new(vec![NodeSpec::new("A", "task"), b], vec![EdgeSpec::new("A", "B")])
}

/// Next live event, `None` once the subscription is closed. Panics if
/// neither happens in time.
pub async fn recv_within(sub: &mut Subscription) -> Option<Event> {
    tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("subscription neither delivered nor closed in time")
}

fn log(n: usize) -> EventInput {
    EventInput::log(LogLevel::Info, format!("line {}", n))
}

fn ids(events: &[Event]) -> Vec<String> {
    events.iter().map(Event::id).collect()
}

// ===== Lifecycle =====

pub async fn create_seeds_queued_run(store: &dyn RunStore) {
    let run_id = store.create_run("nightly", plan_ab()).await.unwrap();
    assert_eq!(run_id.len(), 32);

    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.id, run_id);
    assert_eq!(meta.name, "nightly");
    assert_eq!(meta.status, RunStatus::Queued);
    assert!(!meta.cancelled);
    assert!(meta.started_at.is_none());
    assert!(meta.finished_at.is_none());

    let run = store.get_run(&run_id).await.unwrap();
    assert_eq!(run.meta, meta);
    assert_eq!(run.plan, plan_ab());

    let nodes = store.list_node_states(&run_id).await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Pending));

    assert!(store.list_runs().await.unwrap().contains(&run_id));
}

pub async fn unknown_run_is_not_found(store: &dyn RunStore) {
    let missing = "0123456789abcdef0123456789abcdef";
    assert!(store.get_run_meta(missing).await.unwrap_err().is_not_found());
    assert!(store.get_run(missing).await.unwrap_err().is_not_found());
    assert!(
        store
            .update_run_status(missing, RunStatus::Running.into())
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(store.cancel_run(missing).await.unwrap_err().is_not_found());
    assert!(
        store
            .update_node_state(missing, "A", NodeState::pending("A"))
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(store.get_node_state(missing, "A").await.unwrap_err().is_not_found());
    assert!(
        store
            .set_node_outputs(missing, "A", NodeOutputs::new())
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(store.get_node_outputs(missing, "A").await.unwrap_err().is_not_found());
    assert!(store.append_event(missing, log(0)).await.unwrap_err().is_not_found());
    assert!(store.get_events_since(missing, "").await.unwrap_err().is_not_found());
    assert!(store.subscribe(missing).await.unwrap_err().is_not_found());
    assert!(store.is_cancelled(missing).await.unwrap_err().is_not_found());
}

pub async fn status_updates_apply_and_terminal_is_final(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let started = now_utc();
    store
        .update_run_status(&run_id, RunStatusUpdate::new(RunStatus::Running).started_at(started))
        .await
        .unwrap();
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.status, RunStatus::Running);
    assert_eq!(meta.started_at, Some(started));
    assert!(meta.updated_at >= meta.created_at);

    let finished = now_utc();
    store
        .update_run_status(
            &run_id,
            RunStatusUpdate::new(RunStatus::Failed)
                .finished_at(finished)
                .error("exit code 3"),
        )
        .await
        .unwrap();
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.status, RunStatus::Failed);
    assert_eq!(meta.finished_at, Some(finished));
    assert_eq!(meta.error.as_deref(), Some("exit code 3"));

    // Repeating the terminal status is a no-op.
    store
        .update_run_status(&run_id, RunStatus::Failed.into())
        .await
        .unwrap();

    let err = store
        .update_run_status(&run_id, RunStatus::Running.into())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::TerminalState { status: RunStatus::Failed, .. }
    ));
    assert_eq!(
        store.get_run_meta(&run_id).await.unwrap().status,
        RunStatus::Failed
    );

    // Cancelling a finished run changes nothing.
    store.cancel_run(&run_id).await.unwrap();
    assert!(!store.is_cancelled(&run_id).await.unwrap());
    assert_eq!(
        store.get_run_meta(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

// ===== Node state and outputs =====

pub async fn idempotent_node_updates(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();

    let running = NodeState::pending("A").with_status(NodeStatus::Running, 5);
    assert!(store.update_node_state(&run_id, "A", running).await.unwrap());

    let stale = NodeState::pending("A").with_status(NodeStatus::Failed, 4);
    assert!(!store.update_node_state(&run_id, "A", stale).await.unwrap());
    let same = NodeState::pending("A").with_status(NodeStatus::Failed, 5);
    assert!(!store.update_node_state(&run_id, "A", same).await.unwrap());

    let state = store.get_node_state(&run_id, "A").await.unwrap();
    assert_eq!(state.status, NodeStatus::Running);
    assert_eq!(state.seq, 5);

    let done = NodeState::pending("A").with_status(NodeStatus::Succeeded, 6);
    assert!(store.update_node_state(&run_id, "A", done).await.unwrap());
    assert_eq!(
        store.get_node_state(&run_id, "A").await.unwrap().status,
        NodeStatus::Succeeded
    );

    // A write without a sequence is never newer than the stored state.
    let mut retried = NodeState::pending("A").with_status(NodeStatus::Running, 0);
    retried.retries = 1;
    assert!(!store.update_node_state(&run_id, "A", retried).await.unwrap());
    let state = store.get_node_state(&run_id, "A").await.unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
    assert_eq!(state.retries, 0);
    assert_eq!(state.seq, 6);
}

pub async fn reseeded_node_cannot_erase_projected_progress(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    store
        .append_event(&run_id, EventInput::node_status("A", NodeStatus::Running))
        .await
        .unwrap();
    store
        .append_event(&run_id, EventInput::node_status("A", NodeStatus::Succeeded))
        .await
        .unwrap();

    let before = store.get_node_state(&run_id, "A").await.unwrap();
    assert_eq!(before.status, NodeStatus::Succeeded);
    assert_eq!(before.seq, 2);

    assert!(!store.update_node_state(&run_id, "A", NodeState::pending("A")).await.unwrap());
    assert_eq!(store.get_node_state(&run_id, "A").await.unwrap(), before);
}

pub async fn node_state_upserts_and_reports_missing(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();

    let err = store.get_node_state(&run_id, "ghost").await.unwrap_err();
    assert!(matches!(err, StoreError::NodeNotFound { ref node_id, .. } if node_id == "ghost"));
    assert!(!err.is_not_found());

    // The node id argument wins over the one inside the state.
    let state = NodeState::pending("other").with_status(NodeStatus::Queued, 1);
    assert!(store.update_node_state(&run_id, "extra", state).await.unwrap());
    let stored = store.get_node_state(&run_id, "extra").await.unwrap();
    assert_eq!(stored.node_id, "extra");
    assert_eq!(stored.status, NodeStatus::Queued);

    let ids: Vec<String> = store
        .list_node_states(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.node_id)
        .collect();
    assert_eq!(ids, vec!["A", "B", "extra"]);
}

pub async fn outputs_round_trip_and_default_empty(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    assert!(store.get_node_outputs(&run_id, "A").await.unwrap().is_empty());

    let mut outputs = NodeOutputs::new();
    outputs.insert("rows".to_string(), serde_json::json!(42));
    outputs.insert("path".to_string(), serde_json::json!("/tmp/out.csv"));
    store.set_node_outputs(&run_id, "A", outputs.clone()).await.unwrap();

    assert_eq!(store.get_node_outputs(&run_id, "A").await.unwrap(), outputs);
    assert!(store.get_node_outputs(&run_id, "B").await.unwrap().is_empty());
}

// ===== Events =====

pub async fn monotonic_sequence(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    for n in 0..20 {
        let event = store.append_event(&run_id, log(n)).await.unwrap();
        assert_eq!(event.seq, n as u64 + 1);
        assert_eq!(event.run_id, run_id);
    }

    let events = store.get_events_since(&run_id, "").await.unwrap();
    let expected: Vec<String> = (1..=20).map(|n: u64| n.to_string()).collect();
    assert_eq!(ids(&events), expected);

    let tail = store.get_events_since(&run_id, "17").await.unwrap();
    assert_eq!(ids(&tail), vec!["18", "19", "20"]);
    assert!(store.get_events_since(&run_id, "20").await.unwrap().is_empty());
    assert!(store.get_events_since(&run_id, "999").await.unwrap().is_empty());

    let err = store.get_events_since(&run_id, "abc").await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidEventId(ref id) if id == "abc"));
}

pub async fn appended_event_matches_replayed_event(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let appended = store
        .append_event(
            &run_id,
            EventInput::new(EventType::Checkpoint, serde_json::json!({"label": "halfway"}))
                .for_node("A"),
        )
        .await
        .unwrap();

    let replayed = store.get_events_since(&run_id, "").await.unwrap();
    assert_eq!(replayed, vec![appended.clone()]);
    assert_eq!(appended.node_id.as_deref(), Some("A"));
    assert_eq!(appended.data["label"], "halfway");
}

/// The store must have been created with `event_max_len == cap`.
pub async fn ring_buffer_eviction(store: &dyn RunStore, cap: usize) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let total = cap + 5;
    for n in 0..total {
        store.append_event(&run_id, log(n)).await.unwrap();
    }

    let events = store.get_events_since(&run_id, "").await.unwrap();
    assert_eq!(events.len(), cap);
    assert_eq!(events[0].id(), (total - cap + 1).to_string());
    assert_eq!(events[cap - 1].id(), total.to_string());
    assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
}

pub async fn scenario_plan_a_then_b(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    store
        .append_event(&run_id, EventInput::node_status("A", NodeStatus::Running))
        .await
        .unwrap();
    store
        .append_event(&run_id, EventInput::node_status("A", NodeStatus::Succeeded))
        .await
        .unwrap();
    store
        .append_event(&run_id, EventInput::node_status("B", NodeStatus::Running))
        .await
        .unwrap();

    let events = store.get_events_since(&run_id, "").await.unwrap();
    assert_eq!(ids(&events), vec!["1", "2", "3"]);

    let b = store.get_node_state(&run_id, "B").await.unwrap();
    assert_eq!(b.status, NodeStatus::Running);
    assert_eq!(b.seq, 3);
    assert!(b.started_at.is_some());

    let a = store.get_node_state(&run_id, "A").await.unwrap();
    assert_eq!(a.status, NodeStatus::Succeeded);
    assert!(a.finished_at.is_some());
}

pub async fn control_flow_events_project_onto_nodes(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let loop_started =
        EventInput::with_payload(EventType::LoopStarted, &LoopStartedPayload { total: Some(3) })
            .unwrap()
            .for_node("A");
    let iteration = EventInput::with_payload(
        EventType::LoopIteration,
        &LoopIterationPayload {
            index: 2,
            total: None,
            item: Some(serde_json::json!("c")),
        },
    )
    .unwrap()
    .for_node("A");
    let branch = EventInput::with_payload(
        EventType::BranchSelected,
        &BranchPayload {
            branch: "true".to_string(),
            targets: vec!["B".to_string()],
        },
    )
    .unwrap()
    .for_node("B");

    store.append_event(&run_id, loop_started).await.unwrap();
    store.append_event(&run_id, iteration).await.unwrap();
    store.append_event(&run_id, branch).await.unwrap();

    let a = store.get_node_state(&run_id, "A").await.unwrap();
    assert_eq!(
        a.iteration,
        Some(IterationProgress {
            current: 2,
            total: Some(3)
        })
    );
    let b = store.get_node_state(&run_id, "B").await.unwrap();
    assert_eq!(b.selected_branch.as_deref(), Some("true"));

    // A direct update carrying an older sequence than the projection loses.
    let stale = NodeState::pending("A").with_status(NodeStatus::Failed, 1);
    assert!(!store.update_node_state(&run_id, "A", stale).await.unwrap());
}

// ===== Subscriptions =====

pub async fn subscribers_receive_future_events(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    store.append_event(&run_id, log(0)).await.unwrap();

    let mut first = store.subscribe(&run_id).await.unwrap();
    let mut second = store.subscribe(&run_id).await.unwrap();
    assert_eq!(first.run_id(), run_id);

    let appended = store.append_event(&run_id, log(1)).await.unwrap();
    assert_eq!(recv_within(&mut first).await, Some(appended.clone()));
    assert_eq!(recv_within(&mut second).await, Some(appended));

    second.unsubscribe();
    second.unsubscribe();
    let next = store.append_event(&run_id, log(2)).await.unwrap();
    assert_eq!(recv_within(&mut first).await.map(|e| e.seq), Some(next.seq));
    assert!(second.try_recv().is_none());
}

pub async fn cancellation_closes_subscribers(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let mut first = store.subscribe(&run_id).await.unwrap();
    let mut second = store.subscribe(&run_id).await.unwrap();

    store.cancel_run(&run_id).await.unwrap();
    assert_eq!(recv_within(&mut first).await, None);
    assert_eq!(recv_within(&mut second).await, None);

    // Subscribing afterwards is allowed but yields nothing.
    let mut late = store.subscribe(&run_id).await.unwrap();
    assert_eq!(recv_within(&mut late).await, None);

    // History stays readable.
    assert!(store.get_run(&run_id).await.is_ok());
    assert!(store.get_events_since(&run_id, "").await.is_ok());
}

pub async fn scenario_cancel_queued_run(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    store.cancel_run(&run_id).await.unwrap();

    assert!(store.is_cancelled(&run_id).await.unwrap());
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.status, RunStatus::Cancelled);
    assert!(meta.cancelled);
    assert!(meta.finished_at.is_some());

    // Re-cancelling is a no-op, not an error.
    store.cancel_run(&run_id).await.unwrap();
    assert_eq!(store.get_run_meta(&run_id).await.unwrap().finished_at, meta.finished_at);
}

/// A feed opened mid-run while a writer keeps appending sees every event
/// after its cursor exactly once and in order.
pub async fn replay_and_live_compose_without_gaps(store: Arc<dyn RunStore>) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    for n in 0..10 {
        store.append_event(&run_id, log(n)).await.unwrap();
    }

    let writer = {
        let store = Arc::clone(&store);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            for n in 10..60 {
                store.append_event(&run_id, log(n)).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    let mut feed = EventFeed::open(Arc::clone(&store), &run_id, "4").await.unwrap();
    let mut seen = Vec::new();
    while seen.len() < 56 {
        let event = tokio::time::timeout(WAIT, feed.next())
            .await
            .expect("feed stalled")
            .unwrap()
            .expect("feed ended early");
        seen.push(event.seq);
    }
    writer.await.unwrap();

    assert_eq!(seen, (5..=60).collect::<Vec<u64>>());
    assert_eq!(feed.last_seq(), 60);

    store.cancel_run(&run_id).await.unwrap();
    let end = tokio::time::timeout(WAIT, feed.next()).await.expect("feed did not end");
    assert!(end.unwrap().is_none());
}

// ===== Isolation =====

pub async fn independent_runs(store: Arc<dyn RunStore>) {
    let a = store.create_run("a", plan_ab()).await.unwrap();
    let b = store.create_run("b", plan_ab()).await.unwrap();
    assert_ne!(a, b);

    let mut tasks = Vec::new();
    for run_id in [a.clone(), b.clone()] {
        for worker in 0..4 {
            let store = Arc::clone(&store);
            let run_id = run_id.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    store.append_event(&run_id, log(worker * 100 + n)).await.unwrap();
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    store.cancel_run(&a).await.unwrap();
    for run_id in [&a, &b] {
        let events = store.get_events_since(run_id, "").await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
        assert!(events.iter().all(|e| &e.run_id == run_id));
    }
    assert!(store.is_cancelled(&a).await.unwrap());
    assert!(!store.is_cancelled(&b).await.unwrap());
}

// ===== Diagnostics and shutdown =====

pub async fn adapter_info_names_backend(store: &dyn RunStore, adapter: &str) {
    let info = store.adapter_info().await.unwrap();
    assert_eq!(info["adapter"], adapter);
    assert_eq!(info["healthy"], true);
}

pub async fn close_ends_subscriptions_and_rejects_calls(store: &dyn RunStore) {
    let run_id = store.create_run("", plan_ab()).await.unwrap();
    let mut sub = store.subscribe(&run_id).await.unwrap();

    store.close().await.unwrap();
    assert_eq!(recv_within(&mut sub).await, None);
    assert!(matches!(
        store.get_run_meta(&run_id).await,
        Err(StoreError::Closed)
    ));
    assert!(matches!(
        store.append_event(&run_id, log(0)).await,
        Err(StoreError::Closed)
    ));
    // Closing twice is fine.
    store.close().await.unwrap();
}
