//! Call session management
//!
//! [`CallSessionManager`] owns the full lifecycle of the local party's call:
//! authorization, the call record, SDP exchange, ICE relay, local media and
//! teardown. At most one call is active per manager at a time; a second
//! initiate or answer fails with [`CallError::CallInProgress`].

use crate::authorize::AuthorizationGate;
use crate::directory::UserDirectory;
use crate::error::CallError;
use crate::media::{AudioRouter, LocalMediaStream, MediaProvider, MuteState, PermissionProvider};
use crate::peer::{PeerConnection, PeerConnector, RemoteStreamHandle};
use crate::signaling::{AnswerSubscription, CandidateSubscription, SignalingChannel};
use crate::store::{RealtimeStore, StoreError};
use crate::types::{CallEvent, CallId, CallRecord, CallRole, CallStatus, Party};
use crate::watcher::{watch_call_status, CallStatusEvents};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Device and transport collaborators injected by the host application
pub struct Platform {
    /// The shared realtime store
    pub store: Arc<dyn RealtimeStore>,
    /// Runtime permission prompts
    pub permissions: Arc<dyn PermissionProvider>,
    /// Microphone acquisition
    pub media: Arc<dyn MediaProvider>,
    /// Speaker routing
    pub router: Arc<dyn AudioRouter>,
    /// Peer connection factory
    pub connector: Arc<dyn PeerConnector>,
}

/// Tunables for the session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How many times to look for the remote offer when answering
    pub offer_retry_attempts: u32,
    /// Base delay between offer lookups; attempt `n` waits `n * base`
    pub offer_retry_base: Duration,
    /// Capacity of the call event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offer_retry_attempts: 3,
            offer_retry_base: Duration::from_millis(100),
            event_capacity: 64,
        }
    }
}

struct ActiveCall {
    call_id: CallId,
    role: CallRole,
    peer: Arc<dyn PeerConnection>,
    local_stream: Arc<dyn LocalMediaStream>,
    remote_stream: Option<RemoteStreamHandle>,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionInner {
    store: Arc<dyn RealtimeStore>,
    permissions: Arc<dyn PermissionProvider>,
    media: Arc<dyn MediaProvider>,
    router: Arc<dyn AudioRouter>,
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingChannel,
    directory: UserDirectory,
    gate: AuthorizationGate,
    config: SessionConfig,
    local_user: parking_lot::RwLock<Option<String>>,
    active: Mutex<Option<ActiveCall>>,
    setup_pending: AtomicBool,
    events: broadcast::Sender<CallEvent>,
}

/// Claim on the single call slot while setup runs
///
/// Setup must not hold the `active` lock across open-ended waits (permission
/// prompts, offer retries), so the slot is reserved with a flag instead;
/// dropping the reservation releases it on every exit path.
struct SlotReservation {
    inner: Arc<SessionInner>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.inner.setup_pending.store(false, Ordering::SeqCst);
    }
}

/// Manages the local party's call sessions
///
/// Cheap to clone; clones share the same session state.
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<SessionInner>,
}

impl CallSessionManager {
    /// Create a manager with default configuration
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self::with_config(platform, SessionConfig::default())
    }

    /// Create a manager with explicit configuration
    #[must_use]
    pub fn with_config(platform: Platform, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let signaling = SignalingChannel::new(Arc::clone(&platform.store));
        let directory = UserDirectory::new(Arc::clone(&platform.store));
        let gate = AuthorizationGate::new(Arc::clone(&platform.store));
        Self {
            inner: Arc::new(SessionInner {
                store: platform.store,
                permissions: platform.permissions,
                media: platform.media,
                router: platform.router,
                connector: platform.connector,
                signaling,
                directory,
                gate,
                config,
                local_user: parking_lot::RwLock::new(None),
                active: Mutex::new(None),
                setup_pending: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Set the authenticated local user identity
    pub fn set_local_user(&self, user_id: impl Into<String>) {
        *self.inner.local_user.write() = Some(user_id.into());
    }

    /// Clear the local user identity (sign-out)
    pub fn clear_local_user(&self) {
        *self.inner.local_user.write() = None;
    }

    /// The authenticated local user, if any
    #[must_use]
    pub fn local_user(&self) -> Option<String> {
        self.inner.local_user.read().clone()
    }

    /// Subscribe to call lifecycle events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// The id of the active call, if any
    pub async fn current_call_id(&self) -> Option<CallId> {
        self.inner.active.lock().await.as_ref().map(|call| call.call_id)
    }

    /// The remote stream attached to the active call, if any
    pub async fn remote_stream(&self) -> Option<RemoteStreamHandle> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .and_then(|call| call.remote_stream.clone())
    }

    /// Watch the record of a call for status changes
    #[must_use]
    pub fn listen_to_call_status(&self, call_id: CallId) -> CallStatusEvents {
        watch_call_status(&self.inner.store, call_id)
    }

    /// Start an outgoing call to `callee`
    ///
    /// Checks authorization, acquires local audio, writes the call record,
    /// publishes the offer and starts the background signaling tasks. The
    /// call record is not rolled back when a later step fails; the callee
    /// side treats records it cannot negotiate as missed. Any microphone
    /// stream or peer connection acquired before a failing step is released
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns error when the local user is unset, the call is not allowed,
    /// the microphone is unavailable, or a store/peer operation fails.
    #[tracing::instrument(skip(self, callee, report_id), fields(callee_id = %callee.user_id))]
    pub async fn initiate(
        &self,
        callee: Party,
        report_id: Option<String>,
    ) -> Result<CallId, CallError> {
        let caller_id = self.local_user().ok_or(CallError::AuthenticationMissing)?;

        let permission = self.inner.gate.can_call(&caller_id, &callee.user_id).await;
        if !permission.allowed {
            let reason = permission
                .reason
                .unwrap_or_else(|| "not allowed".to_string());
            return Err(CallError::AuthorizationDenied(reason));
        }

        let reservation = self.reserve_slot().await?;

        if !self.inner.permissions.request_audio_permission().await {
            return Err(CallError::PermissionDenied);
        }
        let local_stream = self.inner.media.acquire_local_audio_stream().await?;

        // The microphone is live from here on; failures must release it (and
        // the peer connection once one exists) before propagating.
        let record_flow = async {
            let caller_role = self
                .inner
                .directory
                .resolve_role(&caller_id)
                .await
                .map_err(CallError::Network)?;
            let caller_name = self.inner.directory.resolve_name(&caller_id, caller_role).await;

            let call_id = CallId::new();
            let record = CallRecord {
                call_id,
                caller: Party {
                    user_id: caller_id.clone(),
                    role: caller_role,
                    name: caller_name,
                },
                callee: callee.clone(),
                status: CallStatus::Ringing,
                created_at: Utc::now(),
                answered_at: None,
                ended_at: None,
                report_id,
            };
            self.inner
                .store
                .set(
                    &format!("calls/{call_id}"),
                    serde_json::to_value(&record).map_err(StoreError::Encode)?,
                )
                .await
                .map_err(CallError::Network)?;
            Ok::<CallId, CallError>(call_id)
        }
        .await;
        let call_id = match record_flow {
            Ok(call_id) => call_id,
            Err(error) => {
                local_stream.stop();
                return Err(error);
            }
        };

        let handle = match self.inner.connector.connect().await {
            Ok(handle) => handle,
            Err(error) => {
                local_stream.stop();
                return Err(error.into());
            }
        };

        let offer_flow = async {
            let offer = handle.connection.create_offer().await?;
            handle.connection.set_local_description(offer.clone()).await?;
            self.inner
                .signaling
                .publish_offer(call_id, &offer)
                .await
                .map_err(CallError::Network)?;
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(error) = offer_flow {
            release_setup(&local_stream, &handle.connection).await;
            return Err(error);
        }

        // Taking the lock before spawning keeps the tasks from observing an
        // empty call slot; they block here until the call is installed.
        let mut active = self.inner.active.lock().await;

        // The remote description arrives asynchronously with the answer;
        // the candidate applier holds back until it has been applied.
        let (ready_tx, ready_rx) = watch::channel(false);
        let answer_watch = self.inner.signaling.subscribe_answer(call_id);
        let callee_candidates = self
            .inner
            .signaling
            .subscribe_ice_candidates(call_id, CallRole::Callee);

        let tasks = vec![
            spawn_candidate_publisher(
                Arc::clone(&self.inner),
                call_id,
                CallRole::Caller,
                handle.events.candidates,
            ),
            spawn_answer_applier(
                Arc::clone(&handle.connection),
                answer_watch,
                ready_tx,
                call_id,
            ),
            spawn_candidate_applier(
                Arc::clone(&handle.connection),
                callee_candidates,
                ready_rx,
                call_id,
            ),
            spawn_remote_stream_task(
                Arc::clone(&self.inner),
                call_id,
                handle.events.remote_streams,
            ),
            spawn_status_watcher(Arc::clone(&self.inner), call_id),
        ];

        *active = Some(ActiveCall {
            call_id,
            role: CallRole::Caller,
            peer: handle.connection,
            local_stream,
            remote_stream: None,
            tasks,
        });
        drop(active);
        drop(reservation);

        tracing::info!(%call_id, "call initiated");
        let _ = self.inner.events.send(CallEvent::CallInitiated {
            call_id,
            callee: callee.user_id,
        });
        Ok(call_id)
    }

    /// Answer an incoming call
    ///
    /// Fetches the caller's offer (retrying briefly, since the offer write
    /// may still be propagating when the incoming notification fires),
    /// publishes the answer and moves the record to `answered`.
    ///
    /// # Errors
    ///
    /// Returns error when no offer appears, the microphone is unavailable,
    /// another call is active, or a store/peer operation fails. The record
    /// is not mutated when the offer is missing, and any microphone stream
    /// or peer connection acquired before a failing step is released before
    /// the error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn answer(&self, call_id: CallId) -> Result<(), CallError> {
        let reservation = self.reserve_slot().await?;

        let offer = self.fetch_offer_with_retry(call_id).await?;

        if !self.inner.permissions.request_audio_permission().await {
            return Err(CallError::PermissionDenied);
        }
        let local_stream = self.inner.media.acquire_local_audio_stream().await?;

        let handle = match self.inner.connector.connect().await {
            Ok(handle) => handle,
            Err(error) => {
                local_stream.stop();
                return Err(error.into());
            }
        };

        let negotiation = async {
            handle.connection.set_remote_description(offer).await?;
            let answer = handle.connection.create_answer().await?;
            handle
                .connection
                .set_local_description(answer.clone())
                .await?;
            self.inner
                .signaling
                .publish_answer(call_id, &answer)
                .await
                .map_err(CallError::Network)?;
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(error) = negotiation {
            release_setup(&local_stream, &handle.connection).await;
            return Err(error);
        }

        // Taking the lock before spawning keeps the tasks from observing an
        // empty call slot; they block here until the call is installed.
        let mut active = self.inner.active.lock().await;

        // Remote description is already applied; candidates flow immediately.
        let (ready_tx, ready_rx) = watch::channel(true);
        drop(ready_tx);
        let caller_candidates = self
            .inner
            .signaling
            .subscribe_ice_candidates(call_id, CallRole::Caller);

        let tasks = vec![
            spawn_candidate_publisher(
                Arc::clone(&self.inner),
                call_id,
                CallRole::Callee,
                handle.events.candidates,
            ),
            spawn_candidate_applier(
                Arc::clone(&handle.connection),
                caller_candidates,
                ready_rx,
                call_id,
            ),
            spawn_remote_stream_task(
                Arc::clone(&self.inner),
                call_id,
                handle.events.remote_streams,
            ),
            spawn_status_watcher(Arc::clone(&self.inner), call_id),
        ];

        *active = Some(ActiveCall {
            call_id,
            role: CallRole::Callee,
            peer: handle.connection,
            local_stream,
            remote_stream: None,
            tasks,
        });
        drop(active);
        drop(reservation);

        self.update_status(call_id, CallStatus::Answered).await?;
        tracing::info!(%call_id, "call answered");
        let _ = self.inner.events.send(CallEvent::CallAnswered { call_id });
        Ok(())
    }

    /// Claim the call slot for setup, failing fast when a call is active or
    /// another setup is underway
    async fn reserve_slot(&self) -> Result<SlotReservation, CallError> {
        let active = self.inner.active.lock().await;
        if active.is_some() || self.inner.setup_pending.swap(true, Ordering::SeqCst) {
            return Err(CallError::CallInProgress);
        }
        drop(active);
        Ok(SlotReservation {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn fetch_offer_with_retry(
        &self,
        call_id: CallId,
    ) -> Result<crate::types::SessionDescription, CallError> {
        let attempts = self.inner.config.offer_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .inner
                .signaling
                .fetch_offer(call_id)
                .await
                .map_err(CallError::Network)?
            {
                Some(offer) => return Ok(offer),
                None if attempt < attempts => {
                    tracing::debug!(%call_id, attempt, "offer not yet available, retrying");
                    tokio::time::sleep(self.inner.config.offer_retry_base * attempt).await;
                }
                None => {}
            }
        }
        Err(CallError::SignalingNotFound("offer"))
    }

    /// Reject an incoming call without setting up media
    ///
    /// # Errors
    ///
    /// Returns error when the record update fails.
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, call_id: CallId) -> Result<(), CallError> {
        self.update_status(call_id, CallStatus::Rejected).await?;
        let _ = self.inner.events.send(CallEvent::CallRejected { call_id });
        Ok(())
    }

    /// End a call and release local resources
    ///
    /// Local teardown always runs, even when the status write fails; the
    /// write error is returned afterwards. Ending a call that is already
    /// terminal is a no-op on the record.
    ///
    /// # Errors
    ///
    /// Returns error when the record update fails.
    #[tracing::instrument(skip(self))]
    pub async fn end(&self, call_id: CallId) -> Result<(), CallError> {
        // Take the active call out of the slot first so the status watcher
        // does not report our own hangup as a remote termination.
        let taken = {
            let mut active = self.inner.active.lock().await;
            match active.as_ref() {
                Some(call) if call.call_id == call_id => active.take(),
                _ => None,
            }
        };

        let result = self.update_status(call_id, CallStatus::Ended).await;

        if let Some(call) = taken {
            teardown(&self.inner, call).await;
        }
        tracing::info!(%call_id, "call ended");
        let _ = self.inner.events.send(CallEvent::CallEnded { call_id });
        result
    }

    /// Toggle the microphone, returning the state after the toggle
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call is active.
    pub async fn toggle_mute(&self) -> Result<MuteState, CallError> {
        let active = self.inner.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NoActiveCall)?;
        let enable = !call.local_stream.audio_enabled();
        call.local_stream.set_audio_enabled(enable);
        Ok(if enable {
            MuteState::Unmuted
        } else {
            MuteState::Muted
        })
    }

    /// Set the microphone mute state, returning the state after the change
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call is active.
    pub async fn set_muted(&self, muted: bool) -> Result<MuteState, CallError> {
        let active = self.inner.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NoActiveCall)?;
        call.local_stream.set_audio_enabled(!muted);
        Ok(if muted {
            MuteState::Muted
        } else {
            MuteState::Unmuted
        })
    }

    /// The current microphone state of the active call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call is active.
    pub async fn mute_state(&self) -> Result<MuteState, CallError> {
        let active = self.inner.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NoActiveCall)?;
        Ok(if call.local_stream.audio_enabled() {
            MuteState::Unmuted
        } else {
            MuteState::Muted
        })
    }

    /// Route call audio to the speakerphone or the earpiece
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call is active.
    pub async fn set_speakerphone(&self, on: bool) -> Result<(), CallError> {
        let active = self.inner.active.lock().await;
        if active.is_none() {
            return Err(CallError::NoActiveCall);
        }
        self.inner.router.set_speakerphone(on);
        Ok(())
    }

    /// Whether audio is routed to the speakerphone
    #[must_use]
    pub fn speakerphone(&self) -> bool {
        self.inner.router.speakerphone()
    }

    /// Flip the speaker route, returning the new state
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoActiveCall`] when no call is active.
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        let active = self.inner.active.lock().await;
        if active.is_none() {
            return Err(CallError::NoActiveCall);
        }
        let on = !self.inner.router.speakerphone();
        self.inner.router.set_speakerphone(on);
        Ok(on)
    }

    /// Validate and apply a status transition on the call record
    ///
    /// Invalid transitions (including repeats of a terminal status) are
    /// logged and dropped rather than failed, which makes hangups racing
    /// from both sides idempotent.
    async fn update_status(&self, call_id: CallId, status: CallStatus) -> Result<(), CallError> {
        let path = format!("calls/{call_id}");
        let record = self
            .inner
            .store
            .get(&path)
            .await
            .map_err(CallError::Network)?;
        if record.is_null() {
            tracing::warn!(%call_id, ?status, "no call record to update");
            return Ok(());
        }

        let current: CallStatus =
            serde_json::from_value(record.get("status").cloned().unwrap_or(Value::Null)).map_err(
                |error| StoreError::Malformed {
                    path: path.clone(),
                    message: error.to_string(),
                },
            )?;
        if !current.can_transition_to(status) {
            tracing::debug!(%call_id, ?current, ?status, "dropping invalid status transition");
            return Ok(());
        }

        let mut fields = Map::new();
        fields.insert(
            "status".to_string(),
            serde_json::to_value(status).map_err(StoreError::Encode)?,
        );
        let timestamp_field = match status {
            CallStatus::Answered => Some("answeredAt"),
            status if status.is_terminal() => Some("endedAt"),
            _ => None,
        };
        if let Some(field) = timestamp_field {
            fields.insert(
                field.to_string(),
                serde_json::to_value(Utc::now()).map_err(StoreError::Encode)?,
            );
        }
        self.inner
            .store
            .update(&path, Value::Object(fields))
            .await
            .map_err(CallError::Network)?;
        Ok(())
    }
}

/// Release a partially set-up call: close the peer and stop the microphone
async fn release_setup(stream: &Arc<dyn LocalMediaStream>, peer: &Arc<dyn PeerConnection>) {
    if let Err(error) = peer.close().await {
        tracing::warn!(%error, "peer close failed while aborting call setup");
    }
    stream.stop();
}

async fn teardown(inner: &SessionInner, call: ActiveCall) {
    if let Err(error) = call.peer.close().await {
        tracing::warn!(call_id = %call.call_id, %error, "peer close failed");
    }
    call.local_stream.stop();
    inner.router.set_speakerphone(false);
    for task in call.tasks {
        task.abort();
    }
    tracing::debug!(call_id = %call.call_id, role = call.role.as_str(), "call resources released");
}

fn spawn_candidate_publisher(
    inner: Arc<SessionInner>,
    call_id: CallId,
    role: CallRole,
    mut candidates: mpsc::UnboundedReceiver<crate::types::IceCandidate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            if let Err(error) = inner
                .signaling
                .publish_ice_candidate(call_id, role, &candidate)
                .await
            {
                tracing::warn!(%call_id, %error, "failed to publish ICE candidate");
            }
        }
    })
}

fn spawn_answer_applier(
    peer: Arc<dyn PeerConnection>,
    mut answers: AnswerSubscription,
    ready_tx: watch::Sender<bool>,
    call_id: CallId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(answer) = answers.recv().await {
            // The store redelivers the answer snapshot; apply it once.
            if peer.has_remote_description().await {
                break;
            }
            match peer.set_remote_description(answer).await {
                Ok(()) => {
                    let _ = ready_tx.send(true);
                    tracing::debug!(%call_id, "remote answer applied");
                    break;
                }
                Err(error) => {
                    tracing::warn!(%call_id, %error, "failed to apply remote answer");
                    break;
                }
            }
        }
    })
}

fn spawn_candidate_applier(
    peer: Arc<dyn PeerConnection>,
    mut candidates: CandidateSubscription,
    mut ready: watch::Receiver<bool>,
    call_id: CallId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            // Candidates observed before the remote description wait here;
            // the subscription keeps them queued in arrival order.
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    return;
                }
            }
            if let Err(error) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(%call_id, %error, "failed to apply remote ICE candidate");
            }
        }
    })
}

fn spawn_remote_stream_task(
    inner: Arc<SessionInner>,
    call_id: CallId,
    mut streams: mpsc::UnboundedReceiver<RemoteStreamHandle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(handle) = streams.recv().await {
            {
                let mut active = inner.active.lock().await;
                match active.as_mut() {
                    Some(call) if call.call_id == call_id => {
                        call.remote_stream = Some(handle);
                    }
                    _ => return,
                }
            }
            // Voice calls route to the speakerphone once remote audio lands.
            inner.router.set_speakerphone(true);
            tracing::info!(%call_id, "remote stream attached");
            let _ = inner
                .events
                .send(CallEvent::RemoteStreamAttached { call_id });
        }
    })
}

fn spawn_status_watcher(inner: Arc<SessionInner>, call_id: CallId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = watch_call_status(&inner.store, call_id);
        while let Some(record) = events.recv().await {
            if !record.status.is_terminal() {
                continue;
            }
            let taken = {
                let mut active = inner.active.lock().await;
                match active.as_ref() {
                    Some(call) if call.call_id == call_id => active.take(),
                    _ => None,
                }
            };
            if let Some(call) = taken {
                tracing::info!(%call_id, status = ?record.status, "remote party terminated call");
                teardown(&inner, call).await;
                let _ = inner.events.send(CallEvent::RemoteTerminated {
                    call_id,
                    status: record.status,
                });
            }
            break;
        }
    })
}
