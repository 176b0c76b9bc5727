use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Client};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Event;
use crate::storage::StoreResult;
use crate::storage::fanout::FanoutTable;
use crate::storage::redis::codec::{RunKeys, StreamEntry, decode_events, stream_id};

const READ_COUNT: usize = 100;

type XReadReply = Option<Vec<(String, Vec<StreamEntry>)>>;

/// `status`, `cancelled` and `cancel_seq` fields of a run's metadata hash.
type MetaFlags = (Option<String>, Option<String>, Option<String>);

#[derive(Debug)]
enum Round {
    Events(Vec<Event>),
    Idle,
    /// The run was cancelled or has expired. The events are the last ones to
    /// deliver before the subscribers are closed.
    Finished(Vec<Event>),
}

/// Decide what a round delivers from the entries it read and the metadata
/// read right after them.
fn settle(events: Vec<Event>, (status, cancelled, cancel_seq): MetaFlags) -> Round {
    if status.is_none() {
        return Round::Finished(Vec::new());
    }
    if cancelled.as_deref() == Some("1") {
        let last = cancel_seq.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        return Round::Finished(events.into_iter().filter(|e| e.seq <= last).collect());
    }
    if events.is_empty() {
        Round::Idle
    } else {
        Round::Events(events)
    }
}

/// Background task tailing one run's event stream and broadcasting new
/// entries to the local subscribers of that run.
///
/// One reader serves every subscriber of the run in this process. It stops
/// when its token is cancelled, and closes the run's subscribers when it
/// observes that the run was cancelled elsewhere or expired.
pub struct TailReader {
    pub client: Client,
    pub run_id: String,
    pub keys: RunKeys,
    pub fanout: Arc<FanoutTable>,
    pub block: Duration,
    pub backoff: Duration,
    /// Sequence of the last event already visible when the reader started.
    pub cursor: u64,
}

impl TailReader {
    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            debug!(run_id = %self.run_id, cursor = self.cursor, "Tail reader started");
            self.run(token).await;
        })
    }

    async fn run(mut self, token: CancellationToken) {
        let mut conn: Option<MultiplexedConnection> = None;
        loop {
            let round = tokio::select! {
                _ = token.cancelled() => break,
                round = self.round(&mut conn) => round,
            };
            match round {
                Ok(Round::Events(events)) => {
                    for event in &events {
                        self.cursor = event.seq;
                        self.fanout.broadcast(&self.run_id, event);
                    }
                }
                Ok(Round::Idle) => {}
                Ok(Round::Finished(events)) => {
                    for event in &events {
                        self.fanout.broadcast(&self.run_id, event);
                    }
                    let closed = self.fanout.close_run(&self.run_id);
                    debug!(run_id = %self.run_id, closed, "Run finished; subscribers closed");
                    break;
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, error = %err, "Tail read failed; retrying");
                    conn = None;
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.backoff) => {}
                    }
                }
            }
        }
        debug!(run_id = %self.run_id, "Tail reader stopped");
    }

    async fn connect(&self) -> StoreResult<MultiplexedConnection> {
        // XREAD BLOCK holds the connection for up to `block`.
        let config = AsyncConnectionConfig::new()
            .set_response_timeout(Some(self.block + Duration::from_secs(5)));
        Ok(self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?)
    }

    async fn round(&self, slot: &mut Option<MultiplexedConnection>) -> StoreResult<Round> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Ok(Round::Idle);
        };

        // Queued behind the blocking XREAD, so the flags are read after it.
        let (reply, flags): (XReadReply, MetaFlags) = redis::pipe()
            .cmd("XREAD")
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(self.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.keys.events)
            .arg(stream_id(self.cursor))
            .cmd("HMGET")
            .arg(&self.keys.meta)
            .arg("status")
            .arg("cancelled")
            .arg("cancel_seq")
            .query_async(conn)
            .await?;
        let entries: Vec<StreamEntry> = reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .collect();
        Ok(settle(decode_events(&self.run_id, entries)?, flags))
    }
}
