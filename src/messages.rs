use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::room::{ParticipantRole, ParticipantSummary};
use crate::types::{ParticipantId, RoomId, SessionId, UserId};

/// Every `type` the coordinator understands. Anything else is kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
    RecordingStart,
    RecordingStop,
    JoinVideoSession,
    Unknown(String),
}

impl SignalKind {
    pub fn as_str(&self) -> &str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::RecordingStart => "recording-start",
            SignalKind::RecordingStop => "recording-stop",
            SignalKind::JoinVideoSession => "join_video_session",
            SignalKind::Unknown(kind) => kind,
        }
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate
        )
    }
}

impl From<String> for SignalKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "offer" => SignalKind::Offer,
            "answer" => SignalKind::Answer,
            "ice-candidate" => SignalKind::IceCandidate,
            "join" => SignalKind::Join,
            "leave" => SignalKind::Leave,
            "recording-start" => SignalKind::RecordingStart,
            "recording-stop" => SignalKind::RecordingStop,
            "join_video_session" => SignalKind::JoinVideoSession,
            _ => SignalKind::Unknown(kind),
        }
    }
}

impl From<SignalKind> for String {
    fn from(kind: SignalKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope exchanged over the real-time channel in both directions.
///
/// Fields the coordinator does not know about are carried in `extra` so that
/// negotiation messages are forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, room_id: impl Into<RoomId>) -> Self {
        SignalEnvelope {
            kind,
            room_id: room_id.into(),
            from: String::new(),
            to: None,
            data: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn from_participant(mut self, from: impl Into<ParticipantId>) -> Self {
        self.from = from.into();
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn to_participant(mut self, to: impl Into<ParticipantId>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// Payload of a `join_video_session` (or `join`) request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: UserId,
    pub name: String,
    pub role: ParticipantRole,
    /// Lets a client join by consultation session when it does not know the room id yet.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// An inbound envelope sorted by what the coordinator has to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Join {
        room_id: RoomId,
        request: JoinRequest,
    },
    Leave {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    /// offer / answer / ice-candidate, and recording toggles: handled by the relay.
    Relay(SignalEnvelope),
    Malformed {
        kind: SignalKind,
        reason: String,
    },
}

impl Signal {
    pub fn parse(text: &str) -> Result<Signal, serde_json::Error> {
        serde_json::from_str::<SignalEnvelope>(text).map(Signal::classify)
    }

    pub fn classify(envelope: SignalEnvelope) -> Signal {
        match envelope.kind {
            SignalKind::Join | SignalKind::JoinVideoSession => {
                let data = envelope.data.unwrap_or(Value::Null);
                match serde_json::from_value::<JoinRequest>(data) {
                    Ok(request) => Signal::Join {
                        room_id: envelope.room_id,
                        request,
                    },
                    Err(e) => Signal::Malformed {
                        kind: envelope.kind,
                        reason: e.to_string(),
                    },
                }
            }
            SignalKind::Leave => Signal::Leave {
                room_id: envelope.room_id,
                participant_id: envelope.from,
            },
            _ => Signal::Relay(envelope),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    VideoSessionJoined {
        room_id: RoomId,
        participant_id: ParticipantId,
        /// Participant expected to send the offer, once a second participant is present.
        initiator_id: Option<ParticipantId>,
        ice_servers: Value,
        participants: Vec<ParticipantSummary>,
    },
    Error {
        message: String,
    },
}
