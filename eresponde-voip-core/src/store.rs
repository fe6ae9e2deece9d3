//! Realtime store abstraction
//!
//! The shared store is an eventually-consistent key-value tree addressed by
//! `/`-separated paths. Subscriptions deliver the *entire snapshot* of the
//! watched path on every mutation that touches it (plus one initial snapshot
//! on subscribe), not a diff; consumers that care about "new" entries must
//! de-duplicate themselves.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend failed the operation
    #[error("store backend error: {0}")]
    Backend(String),

    /// A value could not be encoded for the wire
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A stored value did not have the expected shape
    #[error("malformed record at {path}: {message}")]
    Malformed {
        /// Store path of the offending record
        path: String,
        /// What was wrong with it
        message: String,
    },
}

/// Cancellation handle for a store subscription
///
/// Dropping the guard cancels delivery; subscriptions are scoped resources
/// and every consumer must release its guard on teardown.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    /// Wrap a cancellation closure
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard").finish_non_exhaustive()
    }
}

/// A snapshot subscription on a store path
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Value>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Assemble a subscription from a snapshot channel and its guard
    #[must_use]
    pub fn new(rx: mpsc::UnboundedReceiver<Value>, guard: SubscriptionGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Receive the next snapshot, or `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Receive a snapshot if one is already queued
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription, releasing the watcher
    pub fn cancel(self) {}
}

/// The shared realtime store the calling subsystem signals through
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    /// Read the value at `path`; `Value::Null` when absent
    async fn get(&self, path: &str) -> Result<Value, StoreError>;

    /// Replace the value at `path` (writing `Null` removes it)
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow-merge the fields of an object into the value at `path`
    async fn update(&self, path: &str, fields: Value) -> Result<(), StoreError>;

    /// Append `value` under `path` with a generated child id, returning the id
    ///
    /// Generated ids sort lexicographically in generation order, so iterating
    /// the parent in key order observes children in append order.
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Watch `path`, receiving its full snapshot now and after every mutation
    /// that touches it
    fn subscribe(&self, path: &str) -> Subscription;
}

struct Watcher {
    id: u64,
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Value>,
}

struct MemoryStoreInner {
    root: RwLock<Value>,
    watchers: Mutex<Vec<Watcher>>,
    next_watcher_id: AtomicU64,
    next_push_id: AtomicU64,
}

/// In-process [`RealtimeStore`] implementation
///
/// Complete enough to stand in for the production store: full-snapshot
/// subscriptions with an initial fire, shallow `update`, and ordered push
/// ids. Shared by cloning.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                root: RwLock::new(Value::Object(Map::new())),
                watchers: Mutex::new(Vec::new()),
                next_watcher_id: AtomicU64::new(0),
                next_push_id: AtomicU64::new(0),
            }),
        }
    }

    fn notify(&self, written: &[String]) {
        let root = self.inner.root.read();
        let mut watchers = self.inner.watchers.lock();
        watchers.retain(|watcher| {
            if !paths_intersect(&watcher.path, written) {
                return true;
            }
            watcher.tx.send(value_at(&root, &watcher.path)).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let segments = split_path(path);
        Ok(value_at(&self.inner.root.read(), &segments))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments = split_path(path);
        {
            let mut root = self.inner.root.write();
            write_at(&mut root, &segments, value);
        }
        self.notify(&segments);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = fields else {
            return Err(StoreError::Backend(
                "update requires an object of fields".to_string(),
            ));
        };
        let segments = split_path(path);
        {
            let mut root = self.inner.root.write();
            for (key, value) in fields {
                let mut child = segments.clone();
                child.push(key);
                write_at(&mut root, &child, value);
            }
        }
        self.notify(&segments);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let sequence = self.inner.next_push_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{sequence:012}");
        let mut segments = split_path(path);
        segments.push(id.clone());
        {
            let mut root = self.inner.root.write();
            write_at(&mut root, &segments, value);
        }
        self.notify(&segments);
        Ok(id)
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let segments = split_path(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        {
            let root = self.inner.root.read();
            let _ = tx.send(value_at(&root, &segments));
            self.inner.watchers.lock().push(Watcher {
                id,
                path: segments,
                tx,
            });
        }
        let inner = Arc::clone(&self.inner);
        let guard = SubscriptionGuard::new(move || {
            inner.watchers.lock().retain(|watcher| watcher.id != id);
        });
        Subscription::new(rx, guard)
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn paths_intersect(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn value_at(root: &Value, segments: &[String]) -> Value {
    let mut current = root;
    for segment in segments {
        match current.get(segment) {
            Some(child) => current = child,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn write_at(root: &mut Value, segments: &[String], value: Value) {
    debug_assert!(!segments.is_empty(), "cannot replace the store root");
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        if value.is_null() {
            map.remove(last);
        } else {
            map.insert(last.clone(), value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        store
            .set("calls/abc", json!({"status": "ringing"}))
            .await
            .unwrap();

        let value = store.get("calls/abc/status").await.unwrap();
        assert_eq!(value, json!("ringing"));

        let missing = store.get("calls/nope").await.unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_update_merges_shallow() {
        let store = MemoryStore::new();
        store
            .set("calls/abc", json!({"status": "ringing", "callId": "abc"}))
            .await
            .unwrap();
        store
            .update("calls/abc", json!({"status": "answered", "answeredAt": "t"}))
            .await
            .unwrap();

        let value = store.get("calls/abc").await.unwrap();
        assert_eq!(value["status"], "answered");
        assert_eq!(value["callId"], "abc");
        assert_eq!(value["answeredAt"], "t");
    }

    #[tokio::test]
    async fn test_update_rejects_non_object() {
        let store = MemoryStore::new();
        let result = store.update("calls/abc", json!("answered")).await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_push_preserves_append_order() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store.push("list", json!(n)).await.unwrap();
        }

        let list = store.get("list").await.unwrap();
        let entries: Vec<i64> = list
            .as_object()
            .unwrap()
            .values()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(entries, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_subscribe_initial_and_updates() {
        let store = MemoryStore::new();
        store.set("signaling/c1/offer", json!({"sdp": "v=0"})).await.unwrap();

        let mut sub = store.subscribe("signaling/c1/offer");
        let initial = sub.recv().await.unwrap();
        assert_eq!(initial["sdp"], "v=0");

        store
            .set("signaling/c1/offer", json!({"sdp": "v=1"}))
            .await
            .unwrap();
        let updated = sub.recv().await.unwrap();
        assert_eq!(updated["sdp"], "v=1");
    }

    #[tokio::test]
    async fn test_subscribe_fires_on_child_writes() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("calls");
        assert!(sub.recv().await.unwrap().is_null());

        store.set("calls/c1/status", json!("ringing")).await.unwrap();
        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot["c1"]["status"], "ringing");

        // Writes elsewhere do not fire
        store.set("reports/r1", json!({"id": "r1"})).await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops_delivery() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("calls");
        let _ = sub.recv().await;
        sub.cancel();

        store.set("calls/c1", json!({"x": 1})).await.unwrap();
        assert!(store.inner.watchers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_set_null_removes() {
        let store = MemoryStore::new();
        store.set("calls/c1", json!({"x": 1})).await.unwrap();
        store.set("calls/c1", Value::Null).await.unwrap();
        assert!(store.get("calls/c1").await.unwrap().is_null());
    }
}
