//! Per-session event fan-out feeding the SSE transport.
//!
//! Subscribers get a bounded channel. Critical events (`frame`, `done`,
//! `error`, `aborted`) are delivered with backpressure and never
//! dropped; `text` deltas and status updates are dropped when a slow
//! subscriber's queue is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use hero_schema::Frame;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    Status {
        status: String,
    },
    Text {
        delta: String,
    },
    Frame {
        frame: Frame,
    },
    HmlElement {
        id: String,
        element_type: String,
        phase: ElementPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Done {
        turns: u32,
    },
    Error {
        message: String,
    },
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementPhase {
    Start,
    Complete,
    Error,
}

impl ServerEvent {
    pub fn status(status: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Text { .. } => "text",
            Self::Frame { .. } => "frame",
            Self::HmlElement { phase, .. } => match phase {
                ElementPhase::Start => "hml:element:start",
                ElementPhase::Complete => "hml:element:complete",
                ElementPhase::Error => "hml:element:error",
            },
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Aborted => "aborted",
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Aborted => serde_json::json!({}),
            other => serde_json::to_value(other).unwrap_or_else(|_| serde_json::json!({})),
        }
    }

    /// Critical events are never dropped under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. } | Self::Done { .. } | Self::Error { .. } | Self::Aborted
        )
    }

    /// Terminal events end the subscriber's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. } | Self::Aborted)
    }
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Clone)]
pub struct Broadcaster {
    sessions: Arc<Mutex<HashMap<String, Vec<SubscriberEntry>>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity,
        }
    }

    /// Register a subscriber for a session. Dropping the returned
    /// subscription removes it.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.sessions
            .lock()
            .expect("broadcaster lock")
            .entry(session_id.to_string())
            .or_default()
            .push(SubscriberEntry { id, tx });

        Subscription {
            rx,
            _guard: SubscriberGuard {
                broadcaster: self.clone(),
                session_id: session_id.to_string(),
                id,
            },
        }
    }

    /// Deliver an event to all subscribers of a session, in emission
    /// order per subscriber.
    pub async fn publish(&self, session_id: &str, event: ServerEvent) {
        let senders: Vec<(u64, mpsc::Sender<ServerEvent>)> = {
            let sessions = self.sessions.lock().expect("broadcaster lock");
            sessions
                .get(session_id)
                .map(|subs| subs.iter().map(|s| (s.id, s.tx.clone())).collect())
                .unwrap_or_default()
        };

        let mut closed = Vec::new();
        for (id, tx) in senders {
            if event.is_critical() {
                if tx.send(event.clone()).await.is_err() {
                    closed.push(id);
                }
            } else if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(event.clone()) {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            self.remove(session_id, &closed);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .expect("broadcaster lock")
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(&self, session_id: &str, ids: &[u64]) {
        let mut sessions = self.sessions.lock().expect("broadcaster lock");
        if let Some(subs) = sessions.get_mut(session_id) {
            subs.retain(|s| !ids.contains(&s.id));
            if subs.is_empty() {
                sessions.remove(session_id);
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    pub rx: mpsc::Receiver<ServerEvent>,
    _guard: SubscriberGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

struct SubscriberGuard {
    broadcaster: Broadcaster,
    session_id: String,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.broadcaster.remove(&self.session_id, &[self.id]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe("s1");

        broadcaster
            .publish("s1", ServerEvent::status("calling_api"))
            .await;
        broadcaster
            .publish(
                "s1",
                ServerEvent::Text {
                    delta: "hi".into(),
                },
            )
            .await;
        broadcaster.publish("s1", ServerEvent::Done { turns: 1 }).await;

        assert_eq!(sub.recv().await.unwrap().name(), "status");
        assert_eq!(sub.recv().await.unwrap().name(), "text");
        let done = sub.recv().await.unwrap();
        assert!(done.is_terminal());
    }

    #[tokio::test]
    async fn events_scoped_to_session() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe("s1");

        broadcaster
            .publish("s2", ServerEvent::status("other"))
            .await;
        broadcaster.publish("s1", ServerEvent::Done { turns: 1 }).await;

        // Only the s1 event arrives.
        assert_eq!(sub.recv().await.unwrap().name(), "done");
    }

    #[tokio::test]
    async fn text_dropped_under_backpressure_but_critical_kept() {
        let broadcaster = Broadcaster::with_capacity(2);
        let mut sub = broadcaster.subscribe("s1");

        for i in 0..10 {
            broadcaster
                .publish(
                    "s1",
                    ServerEvent::Text {
                        delta: format!("{i}"),
                    },
                )
                .await;
        }
        // Critical send waits for queue room, so publish concurrently
        // with the reader below.
        let publisher = broadcaster.clone();
        tokio::spawn(async move {
            publisher
                .publish("s1", ServerEvent::Done { turns: 1 })
                .await;
        });

        let mut received = Vec::new();
        while let Some(event) = sub.recv().await {
            let terminal = event.is_terminal();
            received.push(event);
            if terminal {
                break;
            }
        }

        let texts = received.iter().filter(|e| e.name() == "text").count();
        assert!(texts < 10, "slow subscriber should drop text deltas");
        assert_eq!(received.last().unwrap().name(), "done");
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe("s1");
        assert_eq!(broadcaster.subscriber_count("s1"), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count("s1"), 0);
    }

    #[test]
    fn event_names_match_wire_contract() {
        assert_eq!(ServerEvent::status("x").name(), "status");
        assert_eq!(
            ServerEvent::HmlElement {
                id: "e1".into(),
                element_type: "bash".into(),
                phase: ElementPhase::Start,
                message: None,
            }
            .name(),
            "hml:element:start"
        );
        assert_eq!(ServerEvent::Aborted.name(), "aborted");
    }
}
