pub mod fanout;
pub mod memory_store;
#[cfg(feature = "redis")]
pub mod redis;
pub mod replay;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::domain::*;

/// Errors returned by [`RunStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("node {node_id} not found in run {run_id}")]
    NodeNotFound { run_id: String, node_id: String },
    #[error("invalid event id: {0:?}")]
    InvalidEventId(String),
    #[error("run {run_id} is already {status}")]
    TerminalState { run_id: String, status: RunStatus },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "redis")]
    #[error("redis command failed: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// The referenced run does not exist or has expired.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::RunNotFound(_))
    }

    /// Transient failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            #[cfg(feature = "redis")]
            StoreError::Backend(_) => true,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Settings shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Maximum events kept per run; older events are evicted.
    pub event_max_len: usize,
    /// Expiry of an idle run, refreshed on every mutation. `None` keeps runs forever.
    pub ttl: Option<Duration>,
    /// Channel capacity of each live subscription.
    pub subscriber_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_max_len: 5000,
            ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            subscriber_buffer: 100,
        }
    }
}

impl StoreConfig {
    /// Clamp values that would make the store unusable.
    pub fn normalized(mut self) -> Self {
        self.event_max_len = self.event_max_len.max(1);
        self.subscriber_buffer = self.subscriber_buffer.max(1);
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            self.ttl = None;
        }
        self
    }
}

/// Generate an opaque, globally unique run id (32 hex characters).
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Parse a `last_event_id` cursor. Empty means "from the start".
pub fn parse_cursor(last_event_id: &str) -> StoreResult<u64> {
    if last_event_id.is_empty() {
        return Ok(0);
    }
    last_event_id
        .parse()
        .map_err(|_| StoreError::InvalidEventId(last_event_id.to_string()))
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live feed of future events for one run.
///
/// The channel closes when the run is cancelled or the store is closed.
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    run_id: String,
    receiver: mpsc::Receiver<Event>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(
        run_id: &str,
        receiver: mpsc::Receiver<Event>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            receiver,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription whose channel is already closed.
    pub fn closed(run_id: &str) -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            run_id: run_id.to_string(),
            receiver,
            unsubscribe: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Event>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("run_id", &self.run_id)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Run state persistence and event streaming. Implementations are safe for
/// concurrent use and behave identically from a caller's point of view.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a queued run and seed a `pending` state for every plan node.
    async fn create_run(&self, name: &str, plan: Plan) -> StoreResult<String>;

    async fn get_run_meta(&self, run_id: &str) -> StoreResult<RunMeta>;

    /// Full run snapshot including the plan.
    async fn get_run(&self, run_id: &str) -> StoreResult<Run>;

    /// Ids of all known runs, sorted.
    async fn list_runs(&self) -> StoreResult<Vec<String>>;

    /// Set the run status. Leaving a terminal status returns
    /// [`StoreError::TerminalState`]; repeating it is a no-op.
    async fn update_run_status(&self, run_id: &str, update: RunStatusUpdate) -> StoreResult<()>;

    /// Mark the run cancelled and close its live subscriptions. A no-op for a
    /// run that already finished.
    async fn cancel_run(&self, run_id: &str) -> StoreResult<()>;

    /// Upsert a node state. Returns `false` when `state.seq` is not newer than
    /// the stored state's sequence and the write was ignored.
    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        state: NodeState,
    ) -> StoreResult<bool>;

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> StoreResult<NodeState>;

    /// Every node state of the run, sorted by node id.
    async fn list_node_states(&self, run_id: &str) -> StoreResult<Vec<NodeState>>;

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: NodeOutputs,
    ) -> StoreResult<()>;

    /// Outputs of a node; empty when none were stored.
    async fn get_node_outputs(&self, run_id: &str, node_id: &str) -> StoreResult<NodeOutputs>;

    /// Append an event with the next sequence of the run.
    async fn append_event(&self, run_id: &str, input: EventInput) -> StoreResult<Event>;

    /// Retained events with a sequence greater than `last_event_id`, in
    /// order. An empty id means from the start.
    async fn get_events_since(&self, run_id: &str, last_event_id: &str)
    -> StoreResult<Vec<Event>>;

    /// Live feed of events appended after this call returns.
    async fn subscribe(&self, run_id: &str) -> StoreResult<Subscription>;

    async fn is_cancelled(&self, run_id: &str) -> StoreResult<bool>;

    /// Backend diagnostics.
    async fn adapter_info(&self) -> StoreResult<serde_json::Value>;

    /// Close every live subscription and release backend resources.
    async fn close(&self) -> StoreResult<()>;
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => Err(format!("unknown run store backend: {}", other)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// Open a store of the given kind.
#[cfg(feature = "redis")]
pub async fn open_store(
    kind: BackendKind,
    config: StoreConfig,
    redis: redis::RedisStoreConfig,
) -> anyhow::Result<Arc<dyn RunStore>> {
    match kind {
        BackendKind::Memory => Ok(Arc::new(memory_store::MemoryRunStore::new(config))),
        BackendKind::Redis => {
            let store = redis::RedisRunStore::connect(redis.with_store(config)).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Open a store of the given kind.
#[cfg(not(feature = "redis"))]
pub async fn open_store(kind: BackendKind, config: StoreConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    match kind {
        BackendKind::Memory => Ok(Arc::new(memory_store::MemoryRunStore::new(config))),
        BackendKind::Redis => anyhow::bail!("runstore was built without the `redis` feature"),
    }
}
