use std::sync::Mutex;

use tokio::sync::mpsc;

use super::events::FlowEvent;
use super::models::{EventEnvelope, now_ms};

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    session_filter: Option<String>,
    sender: mpsc::Sender<EventEnvelope>,
}

/// Ordered set of live subscriber channels.
///
/// Delivery is `try_send` in registration order: a subscriber whose channel
/// is closed (client gone) or full (client stalled) is dropped on the spot,
/// so a broadcast never waits on anyone. Dropping the sender ends the
/// receiving stream, which is how a stalled client learns it must reconnect.
pub struct Subscribers {
    next_id: SubscriberId,
    entries: Vec<Subscriber>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        capacity: usize,
        session_filter: Option<String>,
    ) -> (SubscriberId, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Subscriber {
            id,
            session_filter,
            sender,
        });
        (id, receiver)
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every channel.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Deliver `envelope` to every matching subscriber. Returns how many
    /// accepted it.
    pub fn broadcast(&mut self, envelope: &EventEnvelope) -> usize {
        let mut delivered = 0;
        self.entries.retain(|sub| {
            if let Some(filter) = &sub.session_filter
                && envelope.session_id.as_deref() != Some(filter.as_str())
            {
                return !sub.sender.is_closed();
            }
            match sub.sender.try_send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = sub.id,
                        event = %envelope.event_type,
                        seq = envelope.seq,
                        "subscriber channel full, dropping subscriber"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = sub.id, "removed disconnected subscriber");
                    false
                }
            }
        });
        delivered
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}

struct HubInner {
    seq: u64,
    subscribers: Subscribers,
}

/// Session-level event stream for executions that belong to no flow.
///
/// Keeps its own sequence counter; subscribers may filter on a session id.
pub struct EventHub {
    capacity: usize,
    inner: Mutex<HubInner>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HubInner {
                seq: 0,
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn subscribe(
        &self,
        session_filter: Option<String>,
    ) -> (SubscriberId, mpsc::Receiver<EventEnvelope>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.add(self.capacity, session_filter)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.remove(id);
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.len()
    }

    /// Sequence and broadcast one event.
    pub fn publish(&self, session_id: Option<&str>, run_id: &str, event: &FlowEvent) -> EventEnvelope {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.seq;
        inner.seq += 1;
        let envelope = EventEnvelope {
            event_type: event.event_type().to_string(),
            ts: now_ms(),
            run_id: run_id.to_string(),
            session_id: session_id.map(str::to_string),
            flow_id: None,
            req_exec_id: None,
            seq,
            payload: event.payload(),
        };
        inner.subscribers.broadcast(&envelope);
        envelope
    }
}
