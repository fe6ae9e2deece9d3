//! Signaling channel over the realtime store
//!
//! Pure message relay scoped under `signaling/{callId}`: one offer, one
//! answer (last write wins, in practice written once) and two append-only
//! role-tagged ICE candidate lists. No semantic validation beyond structural
//! shape; negotiation logic lives in the session manager.

use crate::store::{RealtimeStore, StoreError, Subscription};
use crate::types::{CallId, CallRole, IceCandidate, SessionDescription};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

fn offer_path(call_id: CallId) -> String {
    format!("signaling/{call_id}/offer")
}

fn answer_path(call_id: CallId) -> String {
    format!("signaling/{call_id}/answer")
}

fn candidates_path(call_id: CallId, role: CallRole) -> String {
    format!("signaling/{call_id}/iceCandidates/{}", role.as_str())
}

/// Relay for offers, answers and ICE candidates
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn RealtimeStore>,
}

impl SignalingChannel {
    /// Create a channel over the shared store
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>) -> Self {
        Self { store }
    }

    /// Publish the offer for a call (single write, overwrite semantics)
    ///
    /// # Errors
    ///
    /// Returns error when the store write fails.
    pub async fn publish_offer(
        &self,
        call_id: CallId,
        offer: &SessionDescription,
    ) -> Result<(), StoreError> {
        tracing::debug!(%call_id, "publishing offer");
        self.store
            .set(&offer_path(call_id), serde_json::to_value(offer)?)
            .await
    }

    /// Publish the answer for a call (single write, overwrite semantics)
    ///
    /// # Errors
    ///
    /// Returns error when the store write fails.
    pub async fn publish_answer(
        &self,
        call_id: CallId,
        answer: &SessionDescription,
    ) -> Result<(), StoreError> {
        tracing::debug!(%call_id, "publishing answer");
        self.store
            .set(&answer_path(call_id), serde_json::to_value(answer)?)
            .await
    }

    /// Read the offer for a call, if one has been published
    ///
    /// # Errors
    ///
    /// Returns error when the read fails or the stored value is malformed.
    pub async fn fetch_offer(
        &self,
        call_id: CallId,
    ) -> Result<Option<SessionDescription>, StoreError> {
        self.fetch_description(offer_path(call_id)).await
    }

    /// Read the answer for a call, if one has been published
    ///
    /// # Errors
    ///
    /// Returns error when the read fails or the stored value is malformed.
    pub async fn fetch_answer(
        &self,
        call_id: CallId,
    ) -> Result<Option<SessionDescription>, StoreError> {
        self.fetch_description(answer_path(call_id)).await
    }

    async fn fetch_description(
        &self,
        path: String,
    ) -> Result<Option<SessionDescription>, StoreError> {
        let value = self.store.get(&path).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|error| StoreError::Malformed {
                path,
                message: error.to_string(),
            })
    }

    /// Append a locally discovered ICE candidate to this side's list
    ///
    /// Candidates are write-once, read-many; nothing is ever overwritten.
    ///
    /// # Errors
    ///
    /// Returns error when the store write fails.
    pub async fn publish_ice_candidate(
        &self,
        call_id: CallId,
        role: CallRole,
        candidate: &IceCandidate,
    ) -> Result<(), StoreError> {
        tracing::trace!(%call_id, role = role.as_str(), "publishing ICE candidate");
        self.store
            .push(
                &candidates_path(call_id, role),
                serde_json::to_value(candidate)?,
            )
            .await
            .map(|_| ())
    }

    /// Watch for the answer of a call
    ///
    /// The subscription fires whenever an answer snapshot appears; consumers
    /// should drop it after the first meaningful use. Duplicate fires are
    /// harmless as long as remote-description application is guarded.
    #[must_use]
    pub fn subscribe_answer(&self, call_id: CallId) -> AnswerSubscription {
        AnswerSubscription {
            subscription: self.store.subscribe(&answer_path(call_id)),
            call_id,
        }
    }

    /// Watch the candidate list published by `role`
    ///
    /// Yields each candidate exactly once, in append order, no matter how
    /// many times the store redelivers the list snapshot.
    #[must_use]
    pub fn subscribe_ice_candidates(
        &self,
        call_id: CallId,
        role: CallRole,
    ) -> CandidateSubscription {
        CandidateSubscription {
            subscription: self.store.subscribe(&candidates_path(call_id, role)),
            call_id,
            seen: HashSet::new(),
            pending: VecDeque::new(),
        }
    }
}

/// Subscription yielding the remote answer when it appears
#[derive(Debug)]
pub struct AnswerSubscription {
    subscription: Subscription,
    call_id: CallId,
}

impl AnswerSubscription {
    /// Wait for the next answer snapshot, or `None` once closed
    ///
    /// Empty snapshots (no answer yet) are skipped; malformed snapshots are
    /// logged and skipped without ending the subscription.
    pub async fn recv(&mut self) -> Option<SessionDescription> {
        while let Some(snapshot) = self.subscription.recv().await {
            if snapshot.is_null() {
                continue;
            }
            match serde_json::from_value(snapshot) {
                Ok(answer) => return Some(answer),
                Err(error) => {
                    tracing::warn!(call_id = %self.call_id, %error, "ignoring malformed answer");
                }
            }
        }
        None
    }
}

/// Subscription yielding remote ICE candidates in append order
#[derive(Debug)]
pub struct CandidateSubscription {
    subscription: Subscription,
    call_id: CallId,
    seen: HashSet<String>,
    pending: VecDeque<IceCandidate>,
}

impl CandidateSubscription {
    /// Wait for the next not-yet-seen candidate, or `None` once closed
    pub async fn recv(&mut self) -> Option<IceCandidate> {
        loop {
            if let Some(candidate) = self.pending.pop_front() {
                return Some(candidate);
            }
            let snapshot = self.subscription.recv().await?;
            self.ingest(snapshot);
        }
    }

    fn ingest(&mut self, snapshot: Value) {
        let Some(entries) = snapshot.as_object() else {
            return;
        };
        for (key, value) in entries {
            if !self.seen.insert(key.clone()) {
                continue;
            }
            match serde_json::from_value(value.clone()) {
                Ok(candidate) => self.pending.push_back(candidate),
                Err(error) => {
                    // One malformed candidate must not kill the stream.
                    tracing::warn!(call_id = %self.call_id, key, %error, "skipping malformed candidate");
                }
            }
        }
    }
}
