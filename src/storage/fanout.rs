//! Best-effort fan-out of events to live subscribers.
//!
//! Delivery never blocks the publisher: each subscriber owns a bounded
//! channel and an event that does not fit is dropped for that subscriber
//! only. Readers that miss events recover through `get_events_since`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::Event;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique subscriber id.
pub fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// The senders of all live subscribers of one run.
#[derive(Default)]
pub struct SubscriberSet {
    senders: HashMap<u64, mpsc::Sender<Event>>,
}

impl SubscriberSet {
    pub fn insert(&mut self, id: u64, sender: mpsc::Sender<Event>) {
        self.senders.insert(id, sender);
    }

    /// Remove one subscriber. Dropping its sender closes its channel.
    pub fn remove(&mut self, id: u64) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Copy of the current senders, so delivery can happen outside a lock.
    pub fn snapshot(&self) -> Vec<mpsc::Sender<Event>> {
        self.senders.values().cloned().collect()
    }

    /// Drop every sender, closing all channels.
    pub fn close_all(&mut self) -> usize {
        let count = self.senders.len();
        self.senders.clear();
        count
    }
}

/// Non-blocking delivery to each sender. Returns how many accepted the event.
pub fn deliver(senders: &[mpsc::Sender<Event>], event: &Event) -> usize {
    senders
        .iter()
        .filter(|tx| tx.try_send(event.clone()).is_ok())
        .count()
}

struct RunFanout {
    subscribers: SubscriberSet,
    reader: CancellationToken,
}

/// Local table of run id -> subscribers, with one tail reader per run.
///
/// The reader token is cancelled when the last subscriber of a run leaves,
/// when the run is closed, or when the table is shut down.
#[derive(Default)]
pub struct FanoutTable {
    runs: Mutex<HashMap<String, RunFanout>>,
}

impl FanoutTable {
    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunFanout>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. Returns a fresh reader token when the run had no
    /// active reader, in which case the caller must start one.
    pub fn register(
        &self,
        run_id: &str,
        id: u64,
        sender: mpsc::Sender<Event>,
    ) -> Option<CancellationToken> {
        let mut runs = self.runs();
        match runs.get_mut(run_id) {
            Some(entry) => {
                entry.subscribers.insert(id, sender);
                None
            }
            None => {
                let token = CancellationToken::new();
                let mut subscribers = SubscriberSet::default();
                subscribers.insert(id, sender);
                runs.insert(
                    run_id.to_string(),
                    RunFanout {
                        subscribers,
                        reader: token.clone(),
                    },
                );
                Some(token)
            }
        }
    }

    /// Remove a subscriber; stops the run's reader when it was the last one.
    pub fn unregister(&self, run_id: &str, id: u64) {
        let mut runs = self.runs();
        let Some(entry) = runs.get_mut(run_id) else {
            return;
        };
        entry.subscribers.remove(id);
        if entry.subscribers.is_empty()
            && let Some(entry) = runs.remove(run_id)
        {
            entry.reader.cancel();
        }
    }

    pub fn broadcast(&self, run_id: &str, event: &Event) -> usize {
        let senders = match self.runs().get(run_id) {
            Some(entry) => entry.subscribers.snapshot(),
            None => return 0,
        };
        deliver(&senders, event)
    }

    /// Close every subscriber of a run and stop its reader.
    pub fn close_run(&self, run_id: &str) -> usize {
        match self.runs().remove(run_id) {
            Some(mut entry) => {
                entry.reader.cancel();
                entry.subscribers.close_all()
            }
            None => 0,
        }
    }

    pub fn close_all(&self) -> usize {
        let mut runs = self.runs();
        let mut closed = 0;
        for (_, mut entry) in runs.drain() {
            entry.reader.cancel();
            closed += entry.subscribers.close_all();
        }
        closed
    }

    pub fn active_readers(&self) -> usize {
        self.runs().len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.runs().values().map(|e| e.subscribers.len()).sum()
    }
}
