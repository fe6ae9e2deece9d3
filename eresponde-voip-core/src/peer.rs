//! Peer connection abstraction
//!
//! The session manager drives negotiation through these traits; the default
//! [`WebRtcConnector`] implementation (feature `webrtc-transport`) wraps the
//! `webrtc` crate, and embedders with a platform-native media layer can
//! supply their own connector instead.

use crate::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection failure
#[derive(Error, Debug)]
#[error("{0}")]
pub struct PeerError(pub String);

/// Handle to a remote media stream attached to the peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStreamHandle {
    /// Identifier of the remote stream
    pub stream_id: String,
}

/// One peer connection, live for at most one call
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an SDP answer (requires the remote offer to be set)
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local session description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote session description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Whether a remote description has been applied
    async fn has_remote_description(&self) -> bool;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection and release transport resources
    async fn close(&self) -> Result<(), PeerError>;
}

/// Asynchronous effects emitted by a peer connection
///
/// Candidate discovery runs for the lifetime of the connection; the session
/// manager forwards each one to the signaling channel as it arrives.
pub struct PeerEvents {
    /// Locally discovered ICE candidates, in discovery order
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
    /// Remote media streams as they attach
    pub remote_streams: mpsc::UnboundedReceiver<RemoteStreamHandle>,
}

/// A freshly created peer connection and its event channels
pub struct PeerHandle {
    /// The connection itself
    pub connection: Arc<dyn PeerConnection>,
    /// Its asynchronous effects
    pub events: PeerEvents,
}

/// Creates peer connections for calls
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a new audio-capable peer connection
    async fn connect(&self) -> Result<PeerHandle, PeerError>;
}

#[cfg(feature = "webrtc-transport")]
pub use self::webrtc_transport::WebRtcConnector;

#[cfg(feature = "webrtc-transport")]
mod webrtc_transport {
    use super::*;
    use crate::types::SdpType;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
    use webrtc::ice_transport::ice_server::RTCIceServer;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    /// Peer connector over the `webrtc` crate
    ///
    /// Connections are configured with the given STUN servers and a single
    /// receive-capable audio transceiver.
    pub struct WebRtcConnector {
        stun_servers: Vec<String>,
    }

    impl WebRtcConnector {
        /// Create a connector using the given STUN server URLs
        #[must_use]
        pub fn new(stun_servers: Vec<String>) -> Self {
            Self { stun_servers }
        }
    }

    impl Default for WebRtcConnector {
        fn default() -> Self {
            Self::new(vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ])
        }
    }

    #[async_trait]
    impl PeerConnector for WebRtcConnector {
        async fn connect(&self) -> Result<PeerHandle, PeerError> {
            let mut media_engine = MediaEngine::default();
            media_engine
                .register_default_codecs()
                .map_err(|e| PeerError(format!("failed to register codecs: {e}")))?;
            let api = APIBuilder::new().with_media_engine(media_engine).build();

            let config = RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: self.stun_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            };

            let connection = Arc::new(
                api.new_peer_connection(config)
                    .await
                    .map_err(|e| PeerError(format!("failed to create peer connection: {e}")))?,
            );

            connection
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await
                .map_err(|e| PeerError(format!("failed to add audio transceiver: {e}")))?;

            let (candidate_tx, candidates) = mpsc::unbounded_channel();
            connection.on_ice_candidate(Box::new(move |candidate| {
                let candidate_tx = candidate_tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = candidate_tx.send(IceCandidate {
                                candidate: init.candidate,
                                sdp_mline_index: init.sdp_mline_index.map(u32::from),
                                sdp_mid: init.sdp_mid,
                            });
                        }
                        Err(error) => {
                            tracing::warn!(%error, "failed to serialize local ICE candidate");
                        }
                    }
                })
            }));

            let (stream_tx, remote_streams) = mpsc::unbounded_channel();
            connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let stream_tx = stream_tx.clone();
                Box::pin(async move {
                    let _ = stream_tx.send(RemoteStreamHandle {
                        stream_id: track.stream_id(),
                    });
                })
            }));

            Ok(PeerHandle {
                connection: Arc::new(WebRtcPeer { connection }),
                events: PeerEvents {
                    candidates,
                    remote_streams,
                },
            })
        }
    }

    struct WebRtcPeer {
        connection: Arc<RTCPeerConnection>,
    }

    fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        let result = match desc.kind {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        result.map_err(|e| PeerError(format!("invalid session description: {e}")))
    }

    #[async_trait]
    impl PeerConnection for WebRtcPeer {
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            let offer = self
                .connection
                .create_offer(None)
                .await
                .map_err(|e| PeerError(format!("failed to create offer: {e}")))?;
            Ok(SessionDescription {
                sdp: offer.sdp,
                kind: SdpType::Offer,
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            let answer = self
                .connection
                .create_answer(None)
                .await
                .map_err(|e| PeerError(format!("failed to create answer: {e}")))?;
            Ok(SessionDescription {
                sdp: answer.sdp,
                kind: SdpType::Answer,
            })
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
            self.connection
                .set_local_description(to_rtc_description(desc)?)
                .await
                .map_err(|e| PeerError(format!("failed to set local description: {e}")))
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
            self.connection
                .set_remote_description(to_rtc_description(desc)?)
                .await
                .map_err(|e| PeerError(format!("failed to set remote description: {e}")))
        }

        async fn has_remote_description(&self) -> bool {
            self.connection.remote_description().await.is_some()
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index.map(|index| index as u16),
                username_fragment: None,
            };
            self.connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| PeerError(format!("failed to add ICE candidate: {e}")))
        }

        async fn close(&self) -> Result<(), PeerError> {
            self.connection
                .close()
                .await
                .map_err(|e| PeerError(format!("failed to close peer connection: {e}")))
        }
    }
}
