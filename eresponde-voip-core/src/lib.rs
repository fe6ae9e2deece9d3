//! # eresponde-voip-core
//!
//! Two-party voice calling for the E-Responde emergency platform.
//!
//! Civilians, police officers and the admin dashboard call each other with
//! WebRTC audio, using a shared realtime store as the signaling rendezvous:
//! call records under `calls/`, SDP and ICE exchange under `signaling/`, and
//! account/report data for authorization. No server component of its own is
//! required beyond the store.
//!
//! ## Example
//!
//! ```no_run
//! use eresponde_voip_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     store: Arc<dyn RealtimeStore>,
//! #     permissions: Arc<dyn PermissionProvider>,
//! #     media: Arc<dyn MediaProvider>,
//! #     router: Arc<dyn AudioRouter>,
//! # ) -> Result<(), CallError> {
//! let manager = CallSessionManager::new(Platform {
//!     store: Arc::clone(&store),
//!     permissions,
//!     media,
//!     router,
//!     connector: Arc::new(WebRtcConnector::default()),
//! });
//! manager.set_local_user("civ-1");
//!
//! let call_id = manager
//!     .initiate(
//!         Party {
//!             user_id: "pol-1".to_string(),
//!             role: Role::Police,
//!             name: "Officer Reyes".to_string(),
//!         },
//!         Some("report-42".to_string()),
//!     )
//!     .await?;
//!
//! // ... later, either side hangs up:
//! manager.end(call_id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`]: the realtime store abstraction and an in-process implementation
//! - [`types`]: call records, signaling payloads and lifecycle types
//! - [`directory`]: user role and display name resolution
//! - [`authorize`]: dispatch-relationship call authorization
//! - [`signaling`]: offer/answer/ICE relay over the store
//! - [`session`]: the call session manager
//! - [`watcher`]: incoming call detection and status watching
//! - [`peer`]: the peer connection seam and the `webrtc`-backed connector
//! - [`media`]: microphone, permission and speaker-routing seams
//! - [`testing`]: in-process fakes for the device-facing traits

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod authorize;
pub mod directory;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod testing;
pub mod types;
pub mod watcher;

pub use authorize::{AuthorizationGate, CallPermission};
pub use directory::UserDirectory;
pub use error::CallError;
pub use media::{
    AudioRouter, LocalMediaStream, MediaError, MediaProvider, MuteState, PermissionProvider,
};
pub use peer::{PeerConnection, PeerConnector, PeerError, RemoteStreamHandle};
#[cfg(feature = "webrtc-transport")]
pub use peer::WebRtcConnector;
pub use session::{CallSessionManager, Platform, SessionConfig};
pub use signaling::SignalingChannel;
pub use store::{MemoryStore, RealtimeStore, StoreError, Subscription, SubscriptionGuard};
pub use types::{
    CallEvent, CallId, CallRecord, CallRole, CallStatus, IceCandidate, Party, Role,
    SdpType, SessionDescription,
};
pub use watcher::{watch_call_status, CallStatusEvents, IncomingCallWatcher, IncomingCalls};

/// Commonly used types
pub mod prelude {
    pub use crate::error::CallError;
    pub use crate::media::{
        AudioRouter, MediaProvider, MuteState, PermissionProvider,
    };
    pub use crate::peer::PeerConnector;
    #[cfg(feature = "webrtc-transport")]
    pub use crate::peer::WebRtcConnector;
    pub use crate::session::{CallSessionManager, Platform, SessionConfig};
    pub use crate::store::{MemoryStore, RealtimeStore};
    pub use crate::types::{CallEvent, CallId, CallRecord, CallStatus, Party, Role};
    pub use crate::watcher::IncomingCallWatcher;
}
