//! Gap-free event feed combining replay and live subscription.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::stream;
use tracing::debug;

use crate::domain::Event;
use crate::storage::{RunStore, StoreError, StoreResult, Subscription, parse_cursor};

/// Retained events after `last_seq`.
async fn catch_up(
    store: &Arc<dyn RunStore>,
    run_id: &str,
    last_seq: u64,
) -> StoreResult<Vec<Event>> {
    store.get_events_since(run_id, &last_seq.to_string()).await
}

/// Ordered, de-duplicated events of one run: first the retained history after
/// a cursor, then live events as they are appended.
///
/// The live subscription is opened before the history is read, so an event
/// appended in between arrives at least once and duplicates are dropped by
/// sequence. A jump in live sequences (a slow consumer whose channel filled
/// up) is back-filled from the store.
pub struct EventFeed {
    store: Arc<dyn RunStore>,
    run_id: String,
    subscription: Subscription,
    backlog: VecDeque<Event>,
    last_seq: u64,
    live_closed: bool,
}

impl EventFeed {
    /// Open a feed resuming after `last_event_id`; empty means from the start.
    pub async fn open(
        store: Arc<dyn RunStore>,
        run_id: &str,
        last_event_id: &str,
    ) -> StoreResult<Self> {
        let last_seq = parse_cursor(last_event_id)?;
        let subscription = store.subscribe(run_id).await?;
        let backlog = store.get_events_since(run_id, last_event_id).await?;
        debug!(run_id = %run_id, after = last_seq, replayed = backlog.len(), "Event feed opened");
        Ok(Self {
            store,
            run_id: run_id.to_string(),
            subscription,
            backlog: backlog.into(),
            last_seq,
            live_closed: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sequence of the last event handed out.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Next event, or `None` once the run stopped streaming (cancelled or the
    /// store closed) and every retained event has been delivered.
    pub async fn next(&mut self) -> StoreResult<Option<Event>> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                return Ok(Some(event));
            }
            if self.live_closed {
                return Ok(None);
            }

            let Some(event) = self.subscription.recv().await else {
                self.live_closed = true;
                match catch_up(&self.store, &self.run_id, self.last_seq).await {
                    Ok(rest) => self.backlog.extend(rest),
                    Err(StoreError::Closed | StoreError::RunNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                continue;
            };

            if event.seq <= self.last_seq {
                continue;
            }
            if event.seq > self.last_seq + 1 {
                let missing = catch_up(&self.store, &self.run_id, self.last_seq).await?;
                debug!(
                    run_id = %self.run_id,
                    from = self.last_seq,
                    to = event.seq,
                    recovered = missing.len(),
                    "Back-filling dropped events"
                );
                self.backlog
                    .extend(missing.into_iter().filter(|e| e.seq < event.seq));
                self.backlog.push_back(event);
                continue;
            }
            self.last_seq = event.seq;
            return Ok(Some(event));
        }
    }

    /// Adapt the feed into a `Stream`. A store error ends the stream after
    /// being yielded.
    pub fn into_stream(self) -> impl Stream<Item = StoreResult<Event>> + Send {
        stream::unfold(Some(self), |feed| async move {
            let mut feed = feed?;
            match feed.next().await {
                Ok(Some(event)) => Some((Ok(event), Some(feed))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
