use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};

use crate::flow::models::{CONNECTED_EVENT, HEARTBEAT_EVENT};
use crate::flow::{EventEnvelope, EventHub, FlowManager, SubscriberId, now_ms};

/// Default interval between `heartbeat` frames.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Where a stream's subscriber is registered. Dropping it unsubscribes.
pub enum SubscriptionGuard {
    Flow {
        flows: Arc<FlowManager>,
        flow_id: String,
        id: SubscriberId,
    },
    Session {
        hub: Arc<EventHub>,
        id: SubscriberId,
    },
}

impl SubscriptionGuard {
    fn flow_id(&self) -> Option<&str> {
        match self {
            SubscriptionGuard::Flow { flow_id, .. } => Some(flow_id),
            SubscriptionGuard::Session { .. } => None,
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        match self {
            SubscriptionGuard::Flow { flows, flow_id, id } => {
                flows.unsubscribe(flow_id, *id);
            }
            SubscriptionGuard::Session { hub, id } => hub.unsubscribe(*id),
        }
    }
}

fn transport_frame(event_type: &str, flow_id: Option<&str>) -> Event {
    let envelope = EventEnvelope {
        event_type: event_type.to_string(),
        ts: now_ms(),
        run_id: String::new(),
        session_id: None,
        flow_id: flow_id.map(str::to_string),
        req_exec_id: None,
        seq: 0,
        payload: serde_json::json!({}),
    };
    encode(&envelope)
}

/// One SSE frame: `event:` carries the type, `data:` the JSON envelope.
pub fn encode(envelope: &EventEnvelope) -> Event {
    let event = Event::default().event(&envelope.event_type);
    let event = if envelope.is_transport_frame() {
        event
    } else {
        event.id(envelope.seq.to_string())
    };
    match serde_json::to_string(envelope) {
        Ok(json) => event.data(json),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode envelope");
            Event::default().comment("encode error")
        }
    }
}

enum Next {
    Envelope(Option<EventEnvelope>),
    Heartbeat,
}

struct StreamState {
    backlog: std::vec::IntoIter<EventEnvelope>,
    receiver: mpsc::Receiver<EventEnvelope>,
    heartbeat: Interval,
    connected_sent: bool,
    guard: SubscriptionGuard,
}

/// Turn a subscriber channel into an SSE body.
///
/// Yields a `connected` frame first, then the replayed `backlog`, then every
/// envelope the channel delivers, with a `heartbeat` frame whenever
/// `heartbeat` passes. The stream ends when the channel closes (flow
/// disposed or subscriber dropped for falling behind).
pub fn event_stream(
    receiver: mpsc::Receiver<EventEnvelope>,
    backlog: Vec<EventEnvelope>,
    guard: SubscriptionGuard,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let heartbeat = heartbeat.max(Duration::from_millis(10));
    let state = StreamState {
        backlog: backlog.into_iter(),
        receiver,
        heartbeat: tokio::time::interval_at(Instant::now() + heartbeat, heartbeat),
        connected_sent: false,
        guard,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if !state.connected_sent {
            state.connected_sent = true;
            let frame = transport_frame(CONNECTED_EVENT, state.guard.flow_id());
            return Some((Ok(frame), state));
        }
        if let Some(envelope) = state.backlog.next() {
            return Some((Ok(encode(&envelope)), state));
        }
        let next = tokio::select! {
            envelope = state.receiver.recv() => Next::Envelope(envelope),
            _ = state.heartbeat.tick() => Next::Heartbeat,
        };
        match next {
            Next::Envelope(Some(envelope)) => Some((Ok(encode(&envelope)), state)),
            Next::Envelope(None) => None,
            Next::Heartbeat => {
                let frame = transport_frame(HEARTBEAT_EVENT, state.guard.flow_id());
                Some((Ok(frame), state))
            }
        }
    })
}
