mod common;

use std::sync::Arc;
use std::time::Duration;

use runstore::domain::{EventInput, EventType};
use runstore::storage::memory_store::MemoryRunStore;
use runstore::storage::{RunStore, StoreConfig};

fn store() -> MemoryRunStore {
    MemoryRunStore::default()
}

fn store_with(config: StoreConfig) -> MemoryRunStore {
    MemoryRunStore::new(config)
}

// ===== Shared behaviour =====

#[tokio::test]
async fn test_memory_create_seeds_queued_run() {
    common::create_seeds_queued_run(&store()).await;
}

#[tokio::test]
async fn test_memory_unknown_run_is_not_found() {
    common::unknown_run_is_not_found(&store()).await;
}

#[tokio::test]
async fn test_memory_status_updates() {
    common::status_updates_apply_and_terminal_is_final(&store()).await;
}

#[tokio::test]
async fn test_memory_idempotent_node_updates() {
    common::idempotent_node_updates(&store()).await;
}

#[tokio::test]
async fn test_memory_reseeded_node_keeps_progress() {
    common::reseeded_node_cannot_erase_projected_progress(&store()).await;
}

#[tokio::test]
async fn test_memory_node_state_upserts() {
    common::node_state_upserts_and_reports_missing(&store()).await;
}

#[tokio::test]
async fn test_memory_outputs() {
    common::outputs_round_trip_and_default_empty(&store()).await;
}

#[tokio::test]
async fn test_memory_monotonic_sequence() {
    common::monotonic_sequence(&store()).await;
}

#[tokio::test]
async fn test_memory_appended_event_matches_replay() {
    common::appended_event_matches_replayed_event(&store()).await;
}

#[tokio::test]
async fn test_memory_ring_buffer_1005_events() {
    let store = store_with(StoreConfig {
        event_max_len: 1000,
        ..Default::default()
    });
    common::ring_buffer_eviction(&store, 1000).await;
}

#[tokio::test]
async fn test_memory_ring_buffer_small_cap() {
    let store = store_with(StoreConfig {
        event_max_len: 3,
        ..Default::default()
    });
    common::ring_buffer_eviction(&store, 3).await;
}

#[tokio::test]
async fn test_memory_scenario_a_then_b() {
    common::scenario_plan_a_then_b(&store()).await;
}

#[tokio::test]
async fn test_memory_control_flow_projection() {
    common::control_flow_events_project_onto_nodes(&store()).await;
}

#[tokio::test]
async fn test_memory_subscribers_receive_future_events() {
    common::subscribers_receive_future_events(&store()).await;
}

#[tokio::test]
async fn test_memory_cancel_closes_subscribers() {
    common::cancellation_closes_subscribers(&store()).await;
}

#[tokio::test]
async fn test_memory_cancel_queued_run() {
    common::scenario_cancel_queued_run(&store()).await;
}

#[tokio::test]
async fn test_memory_replay_and_live_compose() {
    common::replay_and_live_compose_without_gaps(Arc::new(store())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_independent_runs() {
    common::independent_runs(Arc::new(store())).await;
}

#[tokio::test]
async fn test_memory_adapter_info() {
    common::adapter_info_names_backend(&store(), "memory").await;
}

#[tokio::test]
async fn test_memory_close() {
    common::close_ends_subscriptions_and_rejects_calls(&store()).await;
}

// ===== Memory-only behaviour =====

#[tokio::test]
async fn test_memory_adapter_info_counts() {
    let store = store_with(StoreConfig {
        event_max_len: 10,
        ttl: None,
        subscriber_buffer: 4,
    });
    let run_id = store.create_run("", common::plan_ab()).await.unwrap();
    let _sub = store.subscribe(&run_id).await.unwrap();
    store.create_run("", common::plan_ab()).await.unwrap();

    let info = store.adapter_info().await.unwrap();
    assert_eq!(info["run_count"], 2);
    assert_eq!(info["subscribers"], 1);
    assert_eq!(info["max_events"], 10);
    assert!(info["ttl_secs"].is_null());
}

#[tokio::test]
async fn test_memory_dropped_subscription_unregisters() {
    let store = store();
    let run_id = store.create_run("", common::plan_ab()).await.unwrap();
    {
        let _sub = store.subscribe(&run_id).await.unwrap();
        assert_eq!(store.adapter_info().await.unwrap()["subscribers"], 1);
    }
    assert_eq!(store.adapter_info().await.unwrap()["subscribers"], 0);
}

#[tokio::test]
async fn test_memory_full_subscriber_drops_events() {
    let store = store_with(StoreConfig {
        subscriber_buffer: 2,
        ..Default::default()
    });
    let run_id = store.create_run("", common::plan_ab()).await.unwrap();
    let mut sub = store.subscribe(&run_id).await.unwrap();

    for _ in 0..5 {
        store
            .append_event(&run_id, EventInput::new(EventType::Progress, serde_json::json!({})))
            .await
            .unwrap();
    }

    // The appender never blocks; the slow consumer keeps what fit.
    assert_eq!(sub.try_recv().map(|e| e.seq), Some(1));
    assert_eq!(sub.try_recv().map(|e| e.seq), Some(2));
    assert!(sub.try_recv().is_none());
    assert_eq!(store.get_events_since(&run_id, "").await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_memory_runs_expire_after_ttl() {
    let store = store_with(StoreConfig {
        ttl: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let run_id = store.create_run("", common::plan_ab()).await.unwrap();
    assert!(store.get_run_meta(&run_id).await.is_ok());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.get_run_meta(&run_id).await.unwrap_err().is_not_found());
    assert!(!store.list_runs().await.unwrap().contains(&run_id));
}

#[tokio::test]
async fn test_memory_purge_expired() {
    let store = store_with(StoreConfig {
        ttl: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    store.create_run("", common::plan_ab()).await.unwrap();
    store.create_run("", common::plan_ab()).await.unwrap();
    assert_eq!(store.purge_expired(), 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(store.purge_expired(), 2);
    assert_eq!(store.adapter_info().await.unwrap()["run_count"], 0);
}

#[tokio::test]
async fn test_memory_no_ttl_keeps_runs() {
    let store = store_with(StoreConfig {
        ttl: Some(Duration::ZERO),
        ..Default::default()
    });
    assert!(store.config().ttl.is_none());
    let run_id = store.create_run("", common::plan_ab()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.purge_expired(), 0);
    assert!(store.get_run_meta(&run_id).await.is_ok());
}
