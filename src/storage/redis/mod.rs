//! Durable run store on Redis.
//!
//! Per run: metadata hash, plan JSON, node-state JSON blob, outputs hash,
//! sequence counter and a capped event stream, all sharing one TTL that every
//! mutation refreshes. Multi-key mutations run as Lua scripts or MULTI
//! pipelines so no caller ever sees a half-applied write.

pub mod codec;
mod scripts;
mod tail;

use std::collections::{BTreeSet, HashMap};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script, ScriptInvocation};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, info};

use crate::domain::*;
use crate::storage::fanout::{FanoutTable, next_subscriber_id};
use crate::storage::{
    RunStore, StoreConfig, StoreError, StoreResult, Subscription, generate_run_id, parse_cursor,
};
use codec::{
    NodeBlob, RunKeys, StreamEntry, decode_events, decode_meta, decode_nodes, fmt_time,
    meta_fields, meta_pattern, run_id_from_meta_key, stream_id,
};
use tail::TailReader;

const NODE_LOCK_STRIPES: usize = 64;
const SCAN_COUNT: usize = 200;

/// Connection and behaviour settings of the Redis backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Namespace of every key, `{prefix}:{run_id}:{part}`.
    pub prefix: String,
    /// Maximum concurrent commands in flight.
    pub pool_size: usize,
    /// Deadline of each store operation.
    pub op_timeout: Duration,
    /// How long one tail read blocks waiting for new events.
    pub read_block: Duration,
    /// Pause before a failed tail read is retried.
    pub retry_backoff: Duration,
    pub store: StoreConfig,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "runs".to_string(),
            pool_size: 10,
            op_timeout: Duration::from_secs(3),
            read_block: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(100),
            store: StoreConfig::default(),
        }
    }
}

impl RedisStoreConfig {
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Wrapper around a managed connection that holds a pool permit until dropped.
pub struct PooledConnection {
    conn: ConnectionManager,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

pub struct RedisRunStore {
    client: Client,
    manager: ConnectionManager,
    permits: Arc<Semaphore>,
    config: RedisStoreConfig,
    fanout: Arc<FanoutTable>,
    node_locks: Vec<Mutex<()>>,
    closed: AtomicBool,
}

impl RedisRunStore {
    /// Open a client and verify the server is reachable.
    pub async fn connect(mut config: RedisStoreConfig) -> StoreResult<Self> {
        config.store = config.store.normalized();
        config.pool_size = config.pool_size.max(1);

        let client = Client::open(config.url.as_str())?;
        let manager = tokio::time::timeout(config.op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(config.op_timeout))??;

        info!(
            prefix = %config.prefix,
            pool_size = config.pool_size,
            ttl_secs = ?config.store.ttl.map(|t| t.as_secs()),
            "Connected to Redis run store"
        );
        Ok(Self {
            client,
            manager,
            permits: Arc::new(Semaphore::new(config.pool_size)),
            node_locks: (0..NODE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            fanout: Arc::new(FanoutTable::default()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn keys(&self, run_id: &str) -> RunKeys {
        RunKeys::new(&self.config.prefix, run_id)
    }

    /// TTL in whole seconds; 0 disables expiry.
    fn ttl_secs(&self) -> u64 {
        self.config.store.ttl.map_or(0, |ttl| ttl.as_secs().max(1))
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn conn(&self) -> StoreResult<PooledConnection> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(PooledConnection {
            conn: self.manager.clone(),
            _permit: permit,
        })
    }

    /// Run one store operation under the configured deadline.
    async fn timed<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        self.ensure_open()?;
        tokio::time::timeout(self.config.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.config.op_timeout))?
    }

    fn prepare<'a>(&self, script: &'a Script, keys: &RunKeys) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in keys.all() {
            invocation.key(key);
        }
        invocation.arg(self.ttl_secs());
        invocation
    }

    fn node_lock(&self, run_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        run_id.hash(&mut hasher);
        &self.node_locks[hasher.finish() as usize % self.node_locks.len()]
    }

    async fn load_nodes(&self, run_id: &str, keys: &RunKeys) -> StoreResult<NodeBlob> {
        let mut conn = self.conn().await?;
        let (exists, raw): (bool, Option<String>) = redis::pipe()
            .cmd("EXISTS")
            .arg(&keys.meta)
            .cmd("GET")
            .arg(&keys.nodes)
            .query_async(&mut *conn)
            .await?;
        if !exists {
            return Err(not_found(run_id));
        }
        decode_nodes(raw)
    }

    async fn store_nodes(&self, run_id: &str, keys: &RunKeys, nodes: &NodeBlob) -> StoreResult<()> {
        let json = serde_json::to_string(nodes)?;
        let mut conn = self.conn().await?;
        let written: i64 = self
            .prepare(&scripts::WRITE_NODES, keys)
            .arg(json)
            .arg(fmt_time(&now_utc()))
            .invoke_async(&mut *conn)
            .await?;
        if written == 0 {
            return Err(not_found(run_id));
        }
        Ok(())
    }

    /// Read-modify-write of one node's state, serialised per run.
    async fn modify_node(
        &self,
        run_id: &str,
        node_id: &str,
        f: impl FnOnce(&mut NodeState) -> bool,
    ) -> StoreResult<bool> {
        let keys = self.keys(run_id);
        let _guard = self.node_lock(run_id).lock().await;
        let mut nodes = self.load_nodes(run_id, &keys).await?;
        let state = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::pending(node_id));
        if !f(state) {
            return Ok(false);
        }
        self.store_nodes(run_id, &keys, &nodes).await?;
        Ok(true)
    }

    async fn read_meta(&self, run_id: &str) -> StoreResult<RunMeta> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.keys(run_id).meta)
            .query_async(&mut *conn)
            .await?;
        decode_meta(run_id, fields)?.ok_or_else(|| not_found(run_id))
    }

    async fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(started.elapsed())
    }
}

fn not_found(run_id: &str) -> StoreError {
    StoreError::RunNotFound(run_id.to_string())
}

fn status_code(run_id: &str, code: i64, status: &str) -> StoreResult<i64> {
    match code {
        scripts::NOT_FOUND => Err(not_found(run_id)),
        scripts::OK | scripts::TERMINAL => Ok(code),
        other => Err(StoreError::Corrupt(format!(
            "unexpected script result {} ({:?})",
            other, status
        ))),
    }
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn create_run(&self, name: &str, plan: Plan) -> StoreResult<String> {
        let run_id = generate_run_id();
        let keys = self.keys(&run_id);
        let meta = RunMeta::queued(&run_id, name);
        let nodes: NodeBlob = plan
            .node_ids()
            .map(|id| (id.to_string(), NodeState::pending(id)))
            .collect();
        let plan_json = serde_json::to_string(&plan)?;
        let nodes_json = serde_json::to_string(&nodes)?;
        let ttl = self.ttl_secs();

        self.timed(async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HSET")
                .arg(&keys.meta)
                .arg(meta_fields(&meta))
                .ignore()
                .cmd("SET")
                .arg(&keys.plan)
                .arg(&plan_json)
                .ignore()
                .cmd("SET")
                .arg(&keys.nodes)
                .arg(&nodes_json)
                .ignore()
                .cmd("SET")
                .arg(&keys.seq)
                .arg(0)
                .ignore();
            if ttl > 0 {
                for key in [&keys.meta, &keys.plan, &keys.nodes, &keys.seq] {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl).ignore();
                }
            }
            pipe.query_async::<()>(&mut *conn).await?;
            Ok(())
        })
        .await?;

        info!(run_id = %run_id, name = %name, "Run created");
        Ok(run_id)
    }

    async fn get_run_meta(&self, run_id: &str) -> StoreResult<RunMeta> {
        self.timed(self.read_meta(run_id)).await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Run> {
        let keys = self.keys(run_id);
        self.timed(async {
            let mut conn = self.conn().await?;
            let (fields, plan): (HashMap<String, String>, Option<String>) = redis::pipe()
                .cmd("HGETALL")
                .arg(&keys.meta)
                .cmd("GET")
                .arg(&keys.plan)
                .query_async(&mut *conn)
                .await?;
            let meta = decode_meta(run_id, fields)?.ok_or_else(|| not_found(run_id))?;
            let plan = match plan {
                Some(json) => serde_json::from_str(&json)?,
                None => return Err(StoreError::Corrupt(format!("run {} has no plan", run_id))),
            };
            Ok(Run { meta, plan })
        })
        .await
    }

    async fn list_runs(&self) -> StoreResult<Vec<String>> {
        let prefix = self.config.prefix.as_str();
        let pattern = meta_pattern(prefix);
        self.timed(async {
            let mut conn = self.conn().await?;
            let mut ids = BTreeSet::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut *conn)
                    .await?;
                ids.extend(
                    keys.iter()
                        .filter_map(|key| run_id_from_meta_key(prefix, key))
                        .map(String::from),
                );
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(ids.into_iter().collect())
        })
        .await
    }

    async fn update_run_status(&self, run_id: &str, update: RunStatusUpdate) -> StoreResult<()> {
        let keys = self.keys(run_id);
        let (code, status): (i64, String) = self
            .timed(async {
                let mut conn = self.conn().await?;
                let opt_time = |at: Option<chrono::DateTime<chrono::Utc>>| {
                    at.map(|t| fmt_time(&t)).unwrap_or_default()
                };
                Ok(self
                    .prepare(&scripts::UPDATE_STATUS, &keys)
                    .arg(update.status.as_str())
                    .arg(opt_time(update.started_at))
                    .arg(opt_time(update.finished_at))
                    .arg(update.error.as_deref().unwrap_or_default())
                    .arg(fmt_time(&now_utc()))
                    .invoke_async(&mut *conn)
                    .await?)
            })
            .await?;

        if status_code(run_id, code, &status)? == scripts::TERMINAL {
            return Err(StoreError::TerminalState {
                run_id: run_id.to_string(),
                status: status.parse().map_err(StoreError::Corrupt)?,
            });
        }
        debug!(run_id = %run_id, status = %update.status, "Run status updated");
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> StoreResult<()> {
        let keys = self.keys(run_id);
        let (code, status): (i64, String) = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(self
                    .prepare(&scripts::CANCEL_RUN, &keys)
                    .arg(fmt_time(&now_utc()))
                    .invoke_async(&mut *conn)
                    .await?)
            })
            .await?;

        if status_code(run_id, code, &status)? == scripts::OK {
            let subscribers = self.fanout.close_run(run_id);
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
        self.timed(self.modify_node(run_id, node_id, |stored| stored.supersede(state)))
            .await
    }

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> StoreResult<NodeState> {
        let keys = self.keys(run_id);
        let mut nodes = self.timed(self.load_nodes(run_id, &keys)).await?;
        nodes.remove(node_id).ok_or_else(|| StoreError::NodeNotFound {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    async fn list_node_states(&self, run_id: &str) -> StoreResult<Vec<NodeState>> {
        let keys = self.keys(run_id);
        let nodes = self.timed(self.load_nodes(run_id, &keys)).await?;
        Ok(nodes.into_values().collect())
    }

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: NodeOutputs,
    ) -> StoreResult<()> {
        let keys = self.keys(run_id);
        let json = serde_json::to_string(&outputs)?;
        let written: i64 = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(self
                    .prepare(&scripts::WRITE_OUTPUTS, &keys)
                    .arg(node_id)
                    .arg(&json)
                    .arg(fmt_time(&now_utc()))
                    .invoke_async(&mut *conn)
                    .await?)
            })
            .await?;
        if written == 0 {
            return Err(not_found(run_id));
        }
        Ok(())
    }

    async fn get_node_outputs(&self, run_id: &str, node_id: &str) -> StoreResult<NodeOutputs> {
        let keys = self.keys(run_id);
        let (exists, raw): (bool, Option<String>) = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(redis::pipe()
                    .cmd("EXISTS")
                    .arg(&keys.meta)
                    .cmd("HGET")
                    .arg(&keys.outputs)
                    .arg(node_id)
                    .query_async(&mut *conn)
                    .await?)
            })
            .await?;
        if !exists {
            return Err(not_found(run_id));
        }
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(NodeOutputs::new()),
        }
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> StoreResult<Event> {
        let keys = self.keys(run_id);
        let timestamp = now_utc();
        let data = serde_json::to_string(&input.data)?;

        let seq: Option<u64> = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(self
                    .prepare(&scripts::APPEND_EVENT, &keys)
                    .arg(self.config.store.event_max_len)
                    .arg(input.event_type.as_str())
                    .arg(input.node_id.as_deref().unwrap_or_default())
                    .arg(fmt_time(&timestamp))
                    .arg(&data)
                    .invoke_async(&mut *conn)
                    .await?)
            })
            .await?;
        let seq = seq.ok_or_else(|| not_found(run_id))?;

        let event = Event {
            seq,
            run_id: run_id.to_string(),
            event_type: input.event_type,
            node_id: input.node_id,
            timestamp,
            data: input.data,
        };
        if event.is_projected()
            && let Some(ref node_id) = event.node_id
        {
            self.timed(self.modify_node(run_id, node_id, |state| event.apply_to(state)))
                .await?;
        }

        debug!(run_id = %run_id, seq, event_type = %event.event_type, "Event appended");
        Ok(event)
    }

    async fn get_events_since(
        &self,
        run_id: &str,
        last_event_id: &str,
    ) -> StoreResult<Vec<Event>> {
        let after = parse_cursor(last_event_id)?;
        let keys = self.keys(run_id);
        let (exists, entries): (bool, Vec<StreamEntry>) = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(redis::pipe()
                    .cmd("EXISTS")
                    .arg(&keys.meta)
                    .cmd("XRANGE")
                    .arg(&keys.events)
                    .arg(stream_id(after.saturating_add(1)))
                    .arg("+")
                    .query_async(&mut *conn)
                    .await?)
            })
            .await?;
        if !exists {
            return Err(not_found(run_id));
        }
        decode_events(run_id, entries)
    }

    async fn subscribe(&self, run_id: &str) -> StoreResult<Subscription> {
        let keys = self.keys(run_id);
        let ((status, cancelled), last_seq): ((Option<String>, Option<String>), Option<u64>) =
            self.timed(async {
                let mut conn = self.conn().await?;
                Ok(redis::pipe()
                    .cmd("HMGET")
                    .arg(&keys.meta)
                    .arg("status")
                    .arg("cancelled")
                    .cmd("GET")
                    .arg(&keys.seq)
                    .query_async(&mut *conn)
                    .await?)
            })
            .await?;
        if status.is_none() {
            return Err(not_found(run_id));
        }
        if cancelled.as_deref() == Some("1") {
            return Ok(Subscription::closed(run_id));
        }

        let id = next_subscriber_id();
        let (tx, rx) = mpsc::channel(self.config.store.subscriber_buffer);
        if let Some(token) = self.fanout.register(run_id, id, tx) {
            TailReader {
                client: self.client.clone(),
                run_id: run_id.to_string(),
                keys,
                fanout: Arc::clone(&self.fanout),
                block: self.config.read_block,
                backoff: self.config.retry_backoff,
                cursor: last_seq.unwrap_or(0),
            }
            .spawn(token);
        }
        debug!(run_id = %run_id, subscriber = id, "Subscribed");

        let fanout = Arc::clone(&self.fanout);
        let owner = run_id.to_string();
        Ok(Subscription::new(run_id, rx, move || {
            fanout.unregister(&owner, id)
        }))
    }

    async fn is_cancelled(&self, run_id: &str) -> StoreResult<bool> {
        let meta_key = self.keys(run_id).meta;
        let (status, cancelled): (Option<String>, Option<String>) = self
            .timed(async {
                let mut conn = self.conn().await?;
                Ok(redis::cmd("HMGET")
                    .arg(&meta_key)
                    .arg("status")
                    .arg("cancelled")
                    .query_async(&mut *conn)
                    .await?)
            })
            .await?;
        if status.is_none() {
            return Err(not_found(run_id));
        }
        Ok(cancelled.as_deref() == Some("1"))
    }

    async fn adapter_info(&self) -> StoreResult<serde_json::Value> {
        let mut info = serde_json::json!({
            "adapter": "redis",
            "prefix": self.config.prefix,
            "ttl_secs": self.config.store.ttl.map(|ttl| ttl.as_secs()),
            "max_events": self.config.store.event_max_len,
            "pool_size": self.config.pool_size,
            "pool_available": self.permits.available_permits(),
            "tail_readers": self.fanout.active_readers(),
            "subscribers": self.fanout.subscriber_count(),
        });
        match self.timed(self.ping()).await {
            Ok(latency) => {
                info["healthy"] = true.into();
                info["latency_ms"] = (latency.as_secs_f64() * 1000.0).into();
            }
            Err(err) => {
                info["healthy"] = false.into();
                info["error"] = err.to_string().into();
            }
        }
        Ok(info)
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let closed = self.fanout.close_all();
        info!(subscribers = closed, "Redis run store closed");
        Ok(())
    }
}
