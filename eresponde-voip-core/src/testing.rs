//! In-process fakes for the device-facing traits
//!
//! Everything the session manager needs besides the store is behind a trait;
//! these fakes let call flows run end to end inside a test process. They are
//! part of the public API so embedders can test their own glue code.

use crate::media::{AudioRouter, LocalMediaStream, MediaError, MediaProvider, PermissionProvider};
use crate::peer::{
    PeerConnection, PeerConnector, PeerError, PeerEvents, PeerHandle, RemoteStreamHandle,
};
use crate::types::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Permission provider with a fixed outcome
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions {
    grant: bool,
}

impl StaticPermissions {
    /// A provider that grants microphone access
    #[must_use]
    pub fn granted() -> Self {
        Self { grant: true }
    }

    /// A provider that denies microphone access
    #[must_use]
    pub fn denied() -> Self {
        Self { grant: false }
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn request_audio_permission(&self) -> bool {
        self.grant
    }
}

/// Inspectable local stream handle
#[derive(Debug, Default)]
pub struct FakeLocalStream {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeLocalStream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    /// Whether `stop` has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMediaStream for FakeLocalStream {
    fn set_audio_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Media provider handing out [`FakeLocalStream`]s
#[derive(Default)]
pub struct FakeMediaProvider {
    failure: Option<String>,
    streams: Mutex<Vec<Arc<FakeLocalStream>>>,
}

impl FakeMediaProvider {
    /// A provider whose acquisitions succeed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose acquisitions fail with `message`
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            streams: Mutex::new(Vec::new()),
        }
    }

    /// The most recently acquired stream, if any
    #[must_use]
    pub fn last_stream(&self) -> Option<Arc<FakeLocalStream>> {
        self.streams.lock().last().cloned()
    }
}

#[async_trait]
impl MediaProvider for FakeMediaProvider {
    async fn acquire_local_audio_stream(&self) -> Result<Arc<dyn LocalMediaStream>, MediaError> {
        if let Some(message) = &self.failure {
            return Err(MediaError(message.clone()));
        }
        let stream = FakeLocalStream::new();
        self.streams.lock().push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Audio router that just records the requested route
#[derive(Debug, Default)]
pub struct FakeAudioRouter {
    speaker: AtomicBool,
}

impl FakeAudioRouter {
    /// A router starting on the earpiece
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioRouter for FakeAudioRouter {
    fn set_speakerphone(&self, on: bool) {
        self.speaker.store(on, Ordering::SeqCst);
    }

    fn speakerphone(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }
}

/// Scripted peer connection
///
/// Descriptions are synthesized, never negotiated; every mutation is recorded
/// for inspection.
pub struct FakePeerConnection {
    serial: u64,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeerConnection {
    fn new(serial: u64) -> Arc<Self> {
        Arc::new(Self {
            serial,
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The remote candidates applied so far, in application order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    /// The remote description applied, if any
    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription {
            sdp: format!("v=0 fake-offer-{}", self.serial),
            kind: SdpType::Offer,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote_description.lock().is_none() {
            return Err(PeerError("no remote offer to answer".to_string()));
        }
        Ok(SessionDescription {
            sdp: format!("v=0 fake-answer-{}", self.serial),
            kind: SdpType::Answer,
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.local_description.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.remote_description.lock() = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote_description.lock().is_none() {
            return Err(PeerError(
                "candidate applied before remote description".to_string(),
            ));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector producing [`FakePeerConnection`]s
///
/// Candidates and remote streams scripted before `connect` are delivered on
/// the next connection's event channels, as if discovery had produced them;
/// `emit_candidate`/`emit_remote_stream` deliver to the latest connection
/// mid-call.
#[derive(Default)]
pub struct FakePeerConnector {
    failure: Option<String>,
    next_serial: AtomicU64,
    scripted_candidates: Mutex<Vec<IceCandidate>>,
    scripted_streams: Mutex<Vec<RemoteStreamHandle>>,
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
    candidate_tx: Mutex<Option<mpsc::UnboundedSender<IceCandidate>>>,
    stream_tx: Mutex<Option<mpsc::UnboundedSender<RemoteStreamHandle>>>,
}

impl FakePeerConnector {
    /// A connector with nothing scripted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose `connect` fails with `message`
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Queue local candidates for the next connection to discover
    pub fn script_candidates(&self, candidates: Vec<IceCandidate>) {
        self.scripted_candidates.lock().extend(candidates);
    }

    /// Queue a remote stream for the next connection to attach
    pub fn script_remote_stream(&self, handle: RemoteStreamHandle) {
        self.scripted_streams.lock().push(handle);
    }

    /// Deliver a locally discovered candidate to the latest connection
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        if let Some(tx) = self.candidate_tx.lock().as_ref() {
            let _ = tx.send(candidate);
        }
    }

    /// Attach a remote stream to the latest connection
    pub fn emit_remote_stream(&self, handle: RemoteStreamHandle) {
        if let Some(tx) = self.stream_tx.lock().as_ref() {
            let _ = tx.send(handle);
        }
    }

    /// The most recently created connection, if any
    #[must_use]
    pub fn last_connection(&self) -> Option<Arc<FakePeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(&self) -> Result<PeerHandle, PeerError> {
        if let Some(message) = &self.failure {
            return Err(PeerError(message.clone()));
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let connection = FakePeerConnection::new(serial);
        self.connections.lock().push(Arc::clone(&connection));

        let (candidate_tx, candidates) = mpsc::unbounded_channel();
        for candidate in self.scripted_candidates.lock().drain(..) {
            let _ = candidate_tx.send(candidate);
        }
        *self.candidate_tx.lock() = Some(candidate_tx);

        let (stream_tx, remote_streams) = mpsc::unbounded_channel();
        for handle in self.scripted_streams.lock().drain(..) {
            let _ = stream_tx.send(handle);
        }
        *self.stream_tx.lock() = Some(stream_tx);

        Ok(PeerHandle {
            connection,
            events: PeerEvents {
                candidates,
                remote_streams,
            },
        })
    }
}
