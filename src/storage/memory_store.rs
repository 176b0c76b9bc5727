use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::*;
use crate::storage::fanout::{SubscriberSet, deliver, next_subscriber_id};
use crate::storage::{
    RunStore, StoreConfig, StoreError, StoreResult, Subscription, generate_run_id, parse_cursor,
};

/// All mutable state of one run, guarded by the run's own lock.
struct RunState {
    meta: RunMeta,
    plan: Plan,
    nodes: HashMap<String, NodeState>,
    outputs: HashMap<String, NodeOutputs>,
    events: VecDeque<Event>,
    last_seq: u64,
    subscribers: SubscriberSet,
    expires_at: Option<Instant>,
}

struct RunRecord {
    state: RwLock<RunState>,
}

impl RunRecord {
    fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunState {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process run store. State lives only as long as the store instance.
///
/// The top-level lock guards the run id -> record map only; every run field
/// sits behind that run's own lock. The two are never held together.
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, Arc<RunRecord>>>,
    config: StoreConfig,
    closed: AtomicBool,
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryRunStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            config: config.normalized(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.ttl.map(|ttl| Instant::now() + ttl)
    }

    fn record(&self, run_id: &str) -> StoreResult<Arc<RunRecord>> {
        self.ensure_open()?;
        let record = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        let expired = record.read().is_expired(Instant::now());
        if expired {
            self.evict(run_id);
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(record)
    }

    /// Run a read-only closure against a live run.
    fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&RunState) -> T) -> StoreResult<T> {
        let record = self.record(run_id)?;
        let state = record.read();
        Ok(f(&state))
    }

    /// Run a mutating closure against a live run and refresh its expiry.
    fn with_run_mut<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunState) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let record = self.record(run_id)?;
        let mut state = record.write();
        let out = f(&mut state)?;
        state.expires_at = self.deadline();
        Ok(out)
    }

    /// Clone the registry so per-run locks are taken without the map lock.
    fn records(&self) -> Vec<(String, Arc<RunRecord>)> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| (id.clone(), Arc::clone(record)))
            .collect()
    }

    fn evict(&self, run_id: &str) {
        let removed = self
            .runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        if let Some(record) = removed {
            record.write().subscribers.close_all();
            debug!(run_id = %run_id, "Expired run evicted");
        }
    }

    /// Remove every expired run. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .records()
            .into_iter()
            .filter(|(_, record)| record.read().is_expired(now))
            .map(|(id, _)| id)
            .collect();
        for run_id in &expired {
            self.evict(run_id);
        }
        expired.len()
    }

    fn unsubscriber(record: &Arc<RunRecord>, id: u64) -> impl FnOnce() + Send + 'static {
        let record: Weak<RunRecord> = Arc::downgrade(record);
        move || {
            if let Some(record) = record.upgrade() {
                record.write().subscribers.remove(id);
            }
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, name: &str, plan: Plan) -> StoreResult<String> {
        self.ensure_open()?;
        let run_id = generate_run_id();
        let nodes = plan
            .node_ids()
            .map(|id| (id.to_string(), NodeState::pending(id)))
            .collect();

        let record = Arc::new(RunRecord {
            state: RwLock::new(RunState {
                meta: RunMeta::queued(&run_id, name),
                plan,
                nodes,
                outputs: HashMap::new(),
                events: VecDeque::new(),
                last_seq: 0,
                subscribers: SubscriberSet::default(),
                expires_at: self.deadline(),
            }),
        });
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), record);

        info!(run_id = %run_id, name = %name, "Run created");
        Ok(run_id)
    }

    async fn get_run_meta(&self, run_id: &str) -> StoreResult<RunMeta> {
        self.with_run(run_id, |run| run.meta.clone())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        self.with_run(run_id, |run| Run {
            meta: run.meta.clone(),
            plan: run.plan.clone(),
        })
    }

    async fn list_runs(&self) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .records()
            .into_iter()
            .filter(|(_, record)| !record.read().is_expired(now))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_run_status(&self, run_id: &str, update: RunStatusUpdate) -> StoreResult<()> {
        self.with_run_mut(run_id, |run| {
            run.meta
                .apply(&update)
                .map_err(|status| StoreError::TerminalState {
                    run_id: run_id.to_string(),
                    status,
                })
        })?;
        debug!(run_id = %run_id, status = %update.status, "Run status updated");
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> StoreResult<()> {
        let closed = self.with_run_mut(run_id, |run| {
            if run.meta.cancel() {
                Ok(Some(run.subscribers.close_all()))
            } else {
                Ok(None)
            }
        })?;
        if let Some(subscribers) = closed {
            info!(run_id = %run_id, subscribers, "Run cancelled");
        }
        Ok(())
    }

    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        mut state: NodeState,
    ) -> StoreResult<bool> {
        state.node_id = node_id.to_string();
        self.with_run_mut(run_id, |run| {
            let applied = match run.nodes.get_mut(node_id) {
                Some(stored) => stored.supersede(state),
                None => {
                    run.nodes.insert(node_id.to_string(), state);
                    true
                }
            };
            if applied {
                run.meta.updated_at = now_utc();
            }
            Ok(applied)
        })
    }

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> StoreResult<NodeState> {
        self.with_run(run_id, |run| run.nodes.get(node_id).cloned())?
            .ok_or_else(|| StoreError::NodeNotFound {
                run_id: run_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    async fn list_node_states(&self, run_id: &str) -> StoreResult<Vec<NodeState>> {
        let mut states = self.with_run(run_id, |run| {
            run.nodes.values().cloned().collect::<Vec<_>>()
        })?;
        states.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(states)
    }

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: NodeOutputs,
    ) -> StoreResult<()> {
        self.with_run_mut(run_id, |run| {
            run.outputs.insert(node_id.to_string(), outputs);
            run.meta.updated_at = now_utc();
            Ok(())
        })
    }

    async fn get_node_outputs(&self, run_id: &str, node_id: &str) -> StoreResult<NodeOutputs> {
        self.with_run(run_id, |run| {
            run.outputs.get(node_id).cloned().unwrap_or_default()
        })
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> StoreResult<Event> {
        let max_len = self.config.event_max_len;
        let (event, senders) = self.with_run_mut(run_id, |run| {
            run.last_seq += 1;
            let event = Event {
                seq: run.last_seq,
                run_id: run_id.to_string(),
                event_type: input.event_type,
                node_id: input.node_id,
                timestamp: now_utc(),
                data: input.data,
            };

            if event.is_projected()
                && let Some(ref node_id) = event.node_id
            {
                let state = run
                    .nodes
                    .entry(node_id.clone())
                    .or_insert_with(|| NodeState::pending(node_id));
                event.apply_to(state);
            }

            while run.events.len() >= max_len {
                run.events.pop_front();
            }
            run.events.push_back(event.clone());
            run.meta.updated_at = event.timestamp;
            Ok((event, run.subscribers.snapshot()))
        })?;

        let delivered = deliver(&senders, &event);
        debug!(
            run_id = %run_id,
            seq = event.seq,
            event_type = %event.event_type,
            delivered,
            subscribers = senders.len(),
            "Event appended"
        );
        Ok(event)
    }

    async fn get_events_since(
        &self,
        run_id: &str,
        last_event_id: &str,
    ) -> StoreResult<Vec<Event>> {
        let after = parse_cursor(last_event_id)?;
        self.with_run(run_id, |run| {
            run.events
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect()
        })
    }

    async fn subscribe(&self, run_id: &str) -> StoreResult<Subscription> {
        let record = self.record(run_id)?;
        let mut state = record.write();
        if state.meta.cancelled {
            return Ok(Subscription::closed(run_id));
        }

        let id = next_subscriber_id();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        state.subscribers.insert(id, tx);
        drop(state);

        debug!(run_id = %run_id, subscriber = id, "Subscribed");
        Ok(Subscription::new(run_id, rx, Self::unsubscriber(&record, id)))
    }

    async fn is_cancelled(&self, run_id: &str) -> StoreResult<bool> {
        self.with_run(run_id, |run| run.meta.cancelled)
    }

    async fn adapter_info(&self) -> StoreResult<serde_json::Value> {
        let records = self.records();
        let subscribers: usize = records
            .iter()
            .map(|(_, record)| record.read().subscribers.len())
            .sum();
        Ok(serde_json::json!({
            "adapter": "memory",
            "healthy": !self.closed.load(Ordering::Acquire),
            "run_count": records.len(),
            "subscribers": subscribers,
            "max_events": self.config.event_max_len,
            "ttl_secs": self.config.ttl.map(|ttl| ttl.as_secs()),
        }))
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let closed: usize = self
            .records()
            .iter()
            .map(|(_, record)| record.write().subscribers.close_all())
            .sum();
        info!(subscribers = closed, "Memory run store closed");
        Ok(())
    }
}
