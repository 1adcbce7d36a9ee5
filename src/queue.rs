//! Per-session delivery queue for undelivered events.
//!
//! Events that cannot reach a live subscriber are retained here, in enqueue
//! order, until a client resubscribes (replay), acknowledges them, or their
//! TTL lapses. The queue is bounded per session; overflow evicts the oldest
//! events and records a `streamError{dropped}` in their place.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::protocol::{ServerEnvelope, ServerEvent};

/// One retained event.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: String,
    pub session_id: String,
    pub envelope: ServerEnvelope,
    pub created_at: DateTime<Utc>,
    /// Clients that have already received this event.
    pub delivered_to: HashSet<String>,
}

/// Ordered per-session queues of undelivered events.
pub struct DeliveryQueue {
    queues: DashMap<String, VecDeque<QueuedEvent>>,
    capacity: usize,
    ttl: Duration,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Retain an event for later delivery.
    ///
    /// On overflow the oldest events are evicted and one
    /// `streamError{dropped}` event is queued in their stead.
    pub fn store(&self, session_id: &str, envelope: ServerEnvelope) {
        let mut queue = self.queues.entry(session_id.to_string()).or_default();

        let id = envelope
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        queue.push_back(QueuedEvent {
            id,
            session_id: session_id.to_string(),
            envelope,
            created_at: Utc::now(),
            delivered_to: HashSet::new(),
        });

        if queue.len() > self.capacity {
            let dropped = queue.len() - self.capacity;
            for _ in 0..dropped {
                queue.pop_front();
            }
            warn!(session = %session_id, dropped, "delivery queue overflow, oldest events evicted");
            let overflow = ServerEnvelope::event(ServerEvent::StreamError {
                session_id: session_id.to_string(),
                reason: "queue_overflow".to_string(),
                message: Some("oldest undelivered events were evicted".to_string()),
                dropped: Some(dropped),
            });
            let id = overflow
                .message_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            queue.push_back(QueuedEvent {
                id,
                session_id: session_id.to_string(),
                envelope: overflow,
                created_at: Utc::now(),
                delivered_to: HashSet::new(),
            });
        }
    }

    /// Replay queued events to a (re)subscribing client, in enqueue order.
    ///
    /// `send` returns whether the frame reached the client; successful sends
    /// mark the event delivered to that client.
    pub fn deliver_queued<F>(&self, session_id: &str, client_id: &str, mut send: F) -> usize
    where
        F: FnMut(&ServerEnvelope) -> bool,
    {
        let Some(mut queue) = self.queues.get_mut(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        for event in queue.iter_mut() {
            if event.delivered_to.contains(client_id) {
                continue;
            }
            if send(&event.envelope) {
                event.delivered_to.insert(client_id.to_string());
                delivered += 1;
            } else {
                // The client went away mid-replay; keep the rest queued.
                break;
            }
        }
        if delivered > 0 {
            debug!(session = %session_id, client = %client_id, delivered, "queued events replayed");
        }
        delivered
    }

    /// Acknowledge delivered events by id. At-least-once: one delivery plus
    /// an acknowledgement removes the event.
    pub fn acknowledge(&self, message_ids: &[String], client_id: &str) -> usize {
        let ids: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut removed = 0;
        for mut entry in self.queues.iter_mut() {
            let queue = entry.value_mut();
            let before = queue.len();
            queue.retain_mut(|event| {
                if ids.contains(event.id.as_str()) {
                    event.delivered_to.insert(client_id.to_string());
                    false
                } else {
                    true
                }
            });
            removed += before - queue.len();
        }
        removed
    }

    /// Drop expired events. Returns how many were removed.
    pub fn expire(&self) -> usize {
        self.expire_at(Utc::now())
    }

    fn expire_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;
        for mut entry in self.queues.iter_mut() {
            let queue = entry.value_mut();
            let before = queue.len();
            queue.retain(|event| event.created_at + ttl >= now);
            removed += before - queue.len();
        }
        if removed > 0 {
            debug!(removed, "expired queued events dropped");
        }
        removed
    }

    /// Drop everything queued for a session.
    pub fn clear(&self, session_id: &str) {
        self.queues.remove(session_id);
    }

    /// Whether a session still has undelivered events.
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.queues
            .get(session_id)
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.queues
            .get(session_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Snapshot of queued envelopes for history queries.
    pub fn snapshot(&self, session_id: &str) -> Vec<ServerEnvelope> {
        self.queues
            .get(session_id)
            .map(|queue| queue.iter().map(|event| event.envelope.clone()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn backdate(&self, session_id: &str, seconds: i64) {
        if let Some(mut queue) = self.queues.get_mut(session_id) {
            for event in queue.iter_mut() {
                event.created_at = Utc::now() - chrono::Duration::seconds(seconds);
            }
        }
    }
}
