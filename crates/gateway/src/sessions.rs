use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A long-lived client connection's outbound mailbox. The pipeline never
/// blocks on a slow consumer: once the queue is saturated, the oldest
/// envelope is dropped and `dropped` is incremented.
pub struct PushSession {
    pub id: String,
    created_at: Instant,
    last_activity_at: Mutex<Instant>,
    queue: Mutex<VecDeque<Value>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl PushSession {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_activity_at: Mutex::new(now),
            queue: Mutex::new(VecDeque::with_capacity(DEFAULT_QUEUE_CAPACITY)),
            capacity: DEFAULT_QUEUE_CAPACITY,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, envelope: Value) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(session = %self.id, "push session queue saturated, dropped oldest envelope");
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
        *self.last_activity_at.lock() = Instant::now();
    }

    /// Waits until an envelope is available or `timeout` elapses, returning
    /// `None` on timeout so the caller can emit a keepalive.
    pub async fn recv(&self, timeout: std::time::Duration) -> Option<Value> {
        loop {
            if let Some(v) = self.queue.lock().pop_front() {
                return Some(v);
            }
            if tokio::time::timeout(timeout, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity_at.lock().elapsed()
    }
}

/// Process-wide registry of open push sessions, keyed by `sessionId`.
/// `create`/`lookup`/`drop` are each individually atomic.
#[derive(Default)]
pub struct SessionsRegistry {
    sessions: RwLock<HashMap<String, Arc<PushSession>>>,
}

impl SessionsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn create(&self) -> Arc<PushSession> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(PushSession::new(id.clone()));
        self.sessions.write().insert(id, session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PushSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_recv_preserves_order() {
        let registry = SessionsRegistry::new();
        let session = registry.create();
        session.push(serde_json::json!({"id": "a"}));
        session.push(serde_json::json!({"id": "b"}));
        session.push(serde_json::json!({"id": "c"}));

        let timeout = std::time::Duration::from_millis(50);
        assert_eq!(session.recv(timeout).await.unwrap()["id"], "a");
        assert_eq!(session.recv(timeout).await.unwrap()["id"], "b");
        assert_eq!(session.recv(timeout).await.unwrap()["id"], "c");
        assert!(session.recv(timeout).await.is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_without_blocking() {
        let registry = SessionsRegistry::new();
        let session = registry.create();
        for i in 0..(DEFAULT_QUEUE_CAPACITY + 10) {
            session.push(serde_json::json!({"seq": i}));
        }
        assert_eq!(session.dropped_count(), 10);

        let timeout = std::time::Duration::from_millis(50);
        let first = session.recv(timeout).await.unwrap();
        assert_eq!(first["seq"], 10);
    }

    #[test]
    fn registry_lookup_and_remove() {
        let registry = SessionsRegistry::new();
        let session = registry.create();
        assert!(registry.get(&session.id).is_some());
        registry.remove(&session.id);
        assert!(registry.get(&session.id).is_none());
    }
}
