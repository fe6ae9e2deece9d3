//! Call operation errors

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by call operations
///
/// `initiate`/`answer`/`end` propagate these to the caller; the UI layer owns
/// user-visible messaging.
#[derive(Error, Debug)]
pub enum CallError {
    /// No local user identity is set
    #[error("user is not authenticated")]
    AuthenticationMissing,

    /// The authorization gate denied the call
    #[error("call not allowed: {0}")]
    AuthorizationDenied(String),

    /// The user declined the microphone permission
    #[error("audio permission denied")]
    PermissionDenied,

    /// The local audio stream could not be acquired
    #[error("failed to acquire local media: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    /// An expected signaling record was absent
    #[error("no {0} found for this call")]
    SignalingNotFound(&'static str),

    /// A store operation failed
    #[error("store operation failed: {0}")]
    Network(#[from] StoreError),

    /// The peer connection layer failed
    #[error("peer negotiation failed: {0}")]
    PeerNegotiation(#[from] PeerError),

    /// A call is already active; exactly one call may be non-idle at a time
    #[error("another call is already in progress")]
    CallInProgress,

    /// The operation requires an active call
    #[error("no active call")]
    NoActiveCall,
}
