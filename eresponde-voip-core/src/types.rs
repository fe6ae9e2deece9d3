//! Call records, signaling payloads and lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account role of a platform user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Civilian account
    Civilian,
    /// Police officer account
    Police,
    /// Administrator account
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Civilian => write!(f, "civilian"),
            Self::Police => write!(f, "police"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Which side of a call a party is on
///
/// ICE candidate lists in the signaling sub-tree are tagged with the role of
/// the party that published them, so each side subscribes to the other's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// The party that initiated the call
    Caller,
    /// The party being called
    Callee,
}

impl CallRole {
    /// Store path segment for this side's candidate list
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
        }
    }

    /// The opposite side
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Caller => Self::Callee,
            Self::Callee => Self::Caller,
        }
    }
}

/// Call lifecycle status as stored in the call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Call created, waiting for the callee
    Ringing,
    /// Callee answered, media negotiation underway or complete
    Answered,
    /// Call finished (either party hung up)
    Ended,
    /// Callee never answered
    Missed,
    /// Callee declined the call
    Rejected,
}

impl CallStatus {
    /// Whether this status admits no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Missed | Self::Rejected)
    }

    /// Whether a transition from `self` to `to` is valid
    ///
    /// Transitions are monotonic: `Ringing` may move to `Answered` or any
    /// terminal status, `Answered` may only end, and terminal statuses are
    /// final.
    #[must_use]
    pub fn can_transition_to(self, to: CallStatus) -> bool {
        matches!(
            (self, to),
            (Self::Ringing, Self::Answered)
                | (Self::Ringing, Self::Ended)
                | (Self::Ringing, Self::Missed)
                | (Self::Ringing, Self::Rejected)
                | (Self::Answered, Self::Ended)
        )
    }
}

/// One party of a call as recorded in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    /// User id of the party
    pub user_id: String,
    /// Account role of the party
    pub role: Role,
    /// Display name resolved at call creation time
    pub name: String,
}

/// A call record under `calls/{callId}`
///
/// Created by the caller on initiate; status mutated by either party through
/// the session manager. Optional timestamps are written by the party that
/// performs the corresponding transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Call identifier (also the record's key)
    pub call_id: CallId,
    /// The initiating party
    pub caller: Party,
    /// The called party
    pub callee: Party,
    /// Current lifecycle status
    pub status: CallStatus,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the callee answered, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    /// When the call ended, if it has
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Crime report this call relates to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// SDP session description exchanged through the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP body
    pub sdp: String,
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpType,
}

/// ICE candidate exchanged through the signaling channel
///
/// Field spellings match the store wire format exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media line index the candidate belongs to
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Session manager notifications for UI collaborators
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An outgoing call was created and its offer published
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// User id of the callee
        callee: String,
    },
    /// The local user answered an incoming call
    CallAnswered {
        /// Call identifier
        call_id: CallId,
    },
    /// The local user rejected an incoming call
    CallRejected {
        /// Call identifier
        call_id: CallId,
    },
    /// The call was ended locally and resources were released
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
    /// A remote media stream was attached to the active call
    RemoteStreamAttached {
        /// Call identifier
        call_id: CallId,
    },
    /// The remote party moved the call to a terminal status
    RemoteTerminated {
        /// Call identifier
        call_id: CallId,
        /// The observed terminal status
        status: CallStatus,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_unique() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_status_transitions() {
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Answered));
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Rejected));
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Missed));
        assert!(CallStatus::Ringing.can_transition_to(CallStatus::Ended));
        assert!(CallStatus::Answered.can_transition_to(CallStatus::Ended));

        assert!(!CallStatus::Answered.can_transition_to(CallStatus::Ringing));
        assert!(!CallStatus::Ended.can_transition_to(CallStatus::Answered));
        assert!(!CallStatus::Rejected.can_transition_to(CallStatus::Ended));
        assert!(!CallStatus::Missed.can_transition_to(CallStatus::Ringing));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
    }

    #[test]
    fn test_call_record_wire_format() {
        let record = CallRecord {
            call_id: CallId::new(),
            caller: Party {
                user_id: "civ-1".to_string(),
                role: Role::Civilian,
                name: "Ana Cruz".to_string(),
            },
            callee: Party {
                user_id: "pol-1".to_string(),
                role: Role::Police,
                name: "Officer Reyes".to_string(),
            },
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            report_id: Some("report-9".to_string()),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("callId").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("reportId").is_some());
        assert!(json.get("answeredAt").is_none());
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["caller"]["userId"], "civ-1");
        assert_eq!(json["caller"]["role"], "civilian");

        let back: CallRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.call_id, record.call_id);
        assert_eq!(back.status, CallStatus::Ringing);
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host".to_string(),
            sdp_mline_index: Some(0),
            sdp_mid: Some("audio".to_string()),
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert!(json.get("sdpMLineIndex").is_some());
        assert!(json.get("sdpMid").is_some());
    }

    #[test]
    fn test_session_description_wire_format() {
        let desc = SessionDescription {
            sdp: "v=0\r\n".to_string(),
            kind: SdpType::Offer,
        };

        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "offer");

        let back: SessionDescription = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, SdpType::Offer);
    }

    #[test]
    fn test_call_role_peer() {
        assert_eq!(CallRole::Caller.peer(), CallRole::Callee);
        assert_eq!(CallRole::Callee.peer(), CallRole::Caller);
        assert_eq!(CallRole::Caller.as_str(), "caller");
    }
}
