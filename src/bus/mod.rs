//! In-process publish-subscribe of session events.
//!
//! Publishing never blocks: each subscriber owns a bounded queue, and a
//! subscriber that falls behind is switched to lossy mode. It then receives
//! a single catch-up marker telling it to re-read the session tail from the
//! store, and resumes live delivery afterwards. Per-session ordering as
//! observed by any single subscriber matches publish order.

mod events;

pub use events::{EventPayload, SessionEvent};

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 128;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
    /// Topic filter; `None` receives everything.
    topics: Option<Vec<String>>,
    /// Set when this subscriber overflowed and still owes a catch-up marker.
    lapsed: bool,
}

#[derive(Default)]
struct SessionTopic {
    next_seq: u64,
    subscribers: Vec<Subscriber>,
}

pub struct EventBus {
    sessions: Mutex<HashMap<String, SessionTopic>>,
    next_subscriber_id: AtomicU64,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Attach a subscriber. It receives only events published after this
    /// call; history comes from the store.
    pub fn subscribe(
        &self,
        session_id: &str,
        topics: Option<Vec<String>>,
    ) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .push(Subscriber {
                id,
                tx,
                topics,
                lapsed: false,
            });
        debug!("subscriber {} attached to session {}", id, session_id);
        rx
    }

    /// Publish an event to every live subscriber of the session. Closed
    /// subscribers are reaped here; slow ones go lossy instead of blocking
    /// the publisher.
    pub fn publish(&self, session_id: &str, payload: EventPayload) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let topic = sessions.entry(session_id.to_string()).or_default();
        let event = SessionEvent {
            session_id: session_id.to_string(),
            seq: topic.next_seq,
            payload,
        };
        topic.next_seq += 1;

        topic.subscribers.retain_mut(|sub| {
            if let Some(ref topics) = sub.topics
                && !topics.iter().any(|t| t == event.payload.topic())
            {
                return true;
            }

            if sub.lapsed {
                // Owe a catch-up marker first; the current event is dropped
                // because the subscriber re-reads the tail from the store.
                let catchup = SessionEvent {
                    session_id: event.session_id.clone(),
                    seq: event.seq,
                    payload: EventPayload::LossyCatchup,
                };
                return match sub.tx.try_send(catchup) {
                    Ok(()) => {
                        sub.lapsed = false;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                };
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "subscriber {} lagging on session {}, switching to lossy",
                        sub.id, session_id
                    );
                    sub.lapsed = true;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("reaping closed subscriber {} on session {}", sub.id, session_id);
                    false
                }
            }
        });
    }

    /// Drop a session's topic state once nothing references it anymore.
    pub fn forget_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }

    #[cfg(test)]
    fn subscriber_count(&self, session_id: &str) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_id)
            .map_or(0, |t| t.subscribers.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
