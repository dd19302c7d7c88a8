//! In-process publish/subscribe event bus (Component G). Feeds the SSE
//! endpoint and drives ETag invalidation for the worktree list.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    Heartbeat { uptime_secs: u64 },
    ContainerStatus { status: String },
    WorktreeCreated { id: String },
    WorktreeUpdated { id: String },
    WorktreeDeleted { id: String },
    WorktreeDirty { id: String },
    WorktreeTodosUpdated { id: String },
    PortOpened { port: u16, service_label: Option<String> },
    PortClosed { port: u16 },
    ProcessStarted { key: String },
    ProcessStopped { key: String },
    ClaudeActivity { worktree_id: String, state: String },
    SessionUpdated { worktree_id: String },
}

impl EventKind {
    fn type_name(&self) -> &'static str {
        match self {
            EventKind::Heartbeat { .. } => "heartbeat",
            EventKind::ContainerStatus { .. } => "container:status",
            EventKind::WorktreeCreated { .. } => "worktree:created",
            EventKind::WorktreeUpdated { .. } => "worktree:updated",
            EventKind::WorktreeDeleted { .. } => "worktree:deleted",
            EventKind::WorktreeDirty { .. } => "worktree:dirty",
            EventKind::WorktreeTodosUpdated { .. } => "worktree:todos_updated",
            EventKind::PortOpened { .. } => "port:opened",
            EventKind::PortClosed { .. } => "port:closed",
            EventKind::ProcessStarted { .. } => "process:started",
            EventKind::ProcessStopped { .. } => "process:stopped",
            EventKind::ClaudeActivity { .. } => "claude:activity",
            EventKind::SessionUpdated { .. } => "session:updated",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: u64,
    pub event: EventEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub ty: &'static str,
    pub payload: EventKind,
}

/// Lock-free-ish pub/sub: a `tokio::sync::broadcast` channel per bus, with a
/// monotonic id counter. Slow subscribers that fall behind the bounded
/// capacity observe a `Lagged` error on their next recv and are treated as
/// disconnected by callers, matching the drop-oldest backpressure policy.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    next_id: AtomicU64,
    start: SystemTime,
}

impl EventBus {
    pub fn new() -> Arc<EventBus> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(EventBus {
            sender,
            next_id: AtomicU64::new(1),
            start: SystemTime::now(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, payload: EventKind) -> Event {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let event = Event {
            id,
            timestamp,
            event: EventEnvelope {
                ty: payload.type_name(),
                payload,
            },
        };

        // No subscribers is not an error; the event is simply unheard.
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().unwrap_or_default().as_secs()
    }
}

/// FNV-1a over an arbitrary hashable tuple, as required verbatim by §4.7 for
/// the worktree-list ETag. `std::hash::Hasher`'s default isn't FNV, so this
/// hand-rolls the 64-bit variant; it's ten lines and an explicit algorithm
/// requirement, not an "ecosystem convenience" worth a crate.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Computes the worktree-list ETag from the sorted per-worktree projection
/// tuples described in §4.7.
pub fn worktree_list_etag(rows: &[(String, String, bool, String, u64)]) -> String {
    let mut sorted = rows.to_vec();
    sorted.sort();

    let mut hasher = DefaultHasher::new();
    let mut buf = Vec::new();
    for (id, head, dirty, activity, prompt_ts) in &sorted {
        buf.clear();
        buf.extend_from_slice(id.as_bytes());
        buf.push(0);
        buf.extend_from_slice(head.as_bytes());
        buf.push(0);
        buf.push(*dirty as u8);
        buf.extend_from_slice(activity.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&prompt_ts.to_le_bytes());
        fnv1a_hash(&buf).hash(&mut hasher);
    }

    format!("\"{:016x}\"", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }

    #[test]
    fn etag_stable_for_same_projection() {
        let rows = vec![("w1".to_string(), "abc".to_string(), false, "idle".to_string(), 0)];
        assert_eq!(worktree_list_etag(&rows), worktree_list_etag(&rows));
    }

    #[test]
    fn etag_changes_on_dirty_flip() {
        let rows_a = vec![("w1".to_string(), "abc".to_string(), false, "idle".to_string(), 0)];
        let rows_b = vec![("w1".to_string(), "abc".to_string(), true, "idle".to_string(), 0)];
        assert_ne!(worktree_list_etag(&rows_a), worktree_list_etag(&rows_b));
    }

    #[tokio::test]
    async fn publish_is_observed_by_subscriber_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(EventKind::PortOpened { port: 3000, service_label: None });
        bus.publish(EventKind::PortClosed { port: 3000 });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.id < second.id);
    }
}
