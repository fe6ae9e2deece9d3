//! Incoming call detection
//!
//! The store delivers the entire `calls` collection on every mutation, so the
//! watcher must both filter and de-duplicate: a call fires at most once per
//! subscription, keyed by call id, no matter how many snapshots mention it.

use crate::store::{RealtimeStore, Subscription};
use crate::types::{CallId, CallRecord, CallStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CALLS: &str = "calls";

/// Detects ringing calls addressed to the local user
#[derive(Clone)]
pub struct IncomingCallWatcher {
    store: Arc<dyn RealtimeStore>,
}

impl IncomingCallWatcher {
    /// Create a watcher over the shared store
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store }
    }

    /// Watch for incoming calls addressed to `user_id`
    ///
    /// A call record fires iff it is structurally complete, its callee is
    /// `user_id`, its status is `ringing`, and its id has not fired on this
    /// subscription before. The seen-set starts empty per subscription and
    /// is never pruned while it lives.
    #[must_use]
    pub fn watch(&self, user_id: &str) -> IncomingCalls {
        let user_id = user_id.to_string();
        let mut subscription = self.store.subscribe(CALLS);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut seen: HashSet<CallId> = HashSet::new();
            while let Some(snapshot) = subscription.recv().await {
                let Some(records) = snapshot.as_object() else {
                    continue;
                };
                let mut skipped = 0usize;
                for value in records.values() {
                    // A corrupt record must not fail the whole scan.
                    let record: CallRecord = match serde_json::from_value(value.clone()) {
                        Ok(record) => record,
                        Err(_) => {
                            skipped += 1;
                            continue;
                        }
                    };
                    if record.callee.user_id != user_id
                        || record.status != CallStatus::Ringing
                        || !seen.insert(record.call_id)
                    {
                        continue;
                    }
                    tracing::info!(call_id = %record.call_id, caller = %record.caller.user_id, "incoming call");
                    if tx.send(record).is_err() {
                        return;
                    }
                }
                if skipped > 0 {
                    tracing::debug!(skipped, "skipped malformed call records");
                }
            }
        });

        IncomingCalls {
            rx,
            _task: TaskGuard(task),
        }
    }
}

/// Stream of incoming call records, at most one per call id
#[derive(Debug)]
pub struct IncomingCalls {
    rx: mpsc::UnboundedReceiver<CallRecord>,
    _task: TaskGuard,
}

impl IncomingCalls {
    /// Wait for the next incoming call, or `None` once the watch ends
    pub async fn recv(&mut self) -> Option<CallRecord> {
        self.rx.recv().await
    }

    /// Receive an incoming call if one is already queued
    pub fn try_recv(&mut self) -> Option<CallRecord> {
        self.rx.try_recv().ok()
    }

    /// Stop watching; the underlying store subscription is released
    pub fn cancel(self) {}
}

#[derive(Debug)]
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Watch the record of one call for status changes
///
/// Fires with the full record on every mutation; skips snapshots that are
/// absent or unparseable. Used by both parties to observe the other side's
/// terminal transitions.
#[must_use]
pub fn watch_call_status(store: &Arc<dyn RealtimeStore>, call_id: CallId) -> CallStatusEvents {
    let subscription = store.subscribe(&format!("{CALLS}/{call_id}"));
    CallStatusEvents {
        subscription,
        call_id,
    }
}

/// Stream of record snapshots for one call
#[derive(Debug)]
pub struct CallStatusEvents {
    subscription: Subscription,
    call_id: CallId,
}

impl CallStatusEvents {
    /// Wait for the next record snapshot, or `None` once closed
    pub async fn recv(&mut self) -> Option<CallRecord> {
        while let Some(snapshot) = self.subscription.recv().await {
            if snapshot.is_null() {
                continue;
            }
            match serde_json::from_value(snapshot) {
                Ok(record) => return Some(record),
                Err(error) => {
                    tracing::warn!(call_id = %self.call_id, %error, "ignoring malformed call record");
                }
            }
        }
        None
    }
}
