//! Local media and device collaborator interfaces
//!
//! The actual microphone, permission prompts and speaker routing live in the
//! host application; the session manager only talks to these traits.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Local media acquisition failure
#[derive(Error, Debug)]
#[error("{0}")]
pub struct MediaError(pub String);

/// Microphone mute state
///
/// Returned by the mute controls instead of a bare boolean; the value always
/// describes the state *after* the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteState {
    /// Outgoing audio is disabled
    Muted,
    /// Outgoing audio is enabled
    Unmuted,
}

impl MuteState {
    /// Whether the microphone is muted
    #[must_use]
    pub fn is_muted(self) -> bool {
        matches!(self, Self::Muted)
    }

    /// The opposite state
    #[must_use]
    pub fn toggled(self) -> Self {
        match self {
            Self::Muted => Self::Unmuted,
            Self::Unmuted => Self::Muted,
        }
    }
}

/// Runtime permission prompts
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Ask the user for microphone access; `true` when granted
    ///
    /// This is an open-ended user-interaction wait; no timeout is enforced.
    async fn request_audio_permission(&self) -> bool;
}

/// A local audio stream handle
///
/// Owned exclusively by the session manager for the lifetime of the active
/// call and stopped on teardown.
pub trait LocalMediaStream: Send + Sync {
    /// Enable or disable the outgoing audio tracks
    fn set_audio_enabled(&self, enabled: bool);

    /// Whether the outgoing audio tracks are enabled
    fn audio_enabled(&self) -> bool;

    /// Stop and release the underlying tracks
    fn stop(&self);
}

/// Device media acquisition
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Acquire an audio-only local stream
    async fn acquire_local_audio_stream(&self) -> Result<Arc<dyn LocalMediaStream>, MediaError>;
}

/// Device audio output routing
pub trait AudioRouter: Send + Sync {
    /// Route call audio to the speakerphone (`true`) or the earpiece (`false`)
    fn set_speakerphone(&self, on: bool);

    /// Whether audio is currently routed to the speakerphone
    fn speakerphone(&self) -> bool;
}
