//! `{ "event": <name>, "data": <payload> }` frames of the room socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RoomError;

pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "peer", alias = "performer")]
    Performer,
    #[serde(rename = "guest")]
    Guest,
}

impl Role {
    /// Host and Performer publish media and can be focused.
    pub fn transmits_media(self) -> bool {
        matches!(self, Role::Host | Role::Performer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    #[serde(rename = "id", alias = "track_id")]
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// User ids arrive either as strings or as numeric profile ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl From<WireId> for ParticipantId {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(text) => text,
            WireId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(rename = "userId", alias = "user_id")]
    user_id: WireId,
}

#[derive(Debug, Deserialize)]
struct UserJoinedPayload {
    #[serde(rename = "userId", alias = "user_id")]
    user_id: WireId,
    #[serde(default = "guest_role")]
    role: Role,
}

fn guest_role() -> Role {
    Role::Guest
}

#[derive(Debug, Deserialize)]
struct ChatPayload {
    #[serde(default, rename = "userId", alias = "user_id")]
    user_id: Option<WireId>,
    #[serde(default, rename = "displayName", alias = "display_name")]
    display_name: Option<String>,
    #[serde(alias = "message")]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GiftPayload {
    #[serde(default, rename = "userId", alias = "user_id")]
    user_id: Option<WireId>,
    #[serde(default, rename = "displayName", alias = "display_name")]
    display_name: Option<String>,
    #[serde(alias = "giftAmount")]
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct QueuePayload {
    #[serde(default)]
    queue: Vec<WireId>,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    TrackChange(Option<Song>),
    UserJoined { id: ParticipantId, role: Role },
    UserLeft { id: ParticipantId },
    JoinRequest { id: ParticipantId },
    JoinApproved { id: ParticipantId },
    JoinRejected { id: ParticipantId },
    SessionEnded,
    SoundtrackPlay,
    SoundtrackPause,
    QueueUpdate { queue: Vec<String> },
    Chat {
        user_id: Option<ParticipantId>,
        display_name: Option<String>,
        text: String,
    },
    Gift {
        user_id: Option<ParticipantId>,
        display_name: Option<String>,
        amount: u64,
    },
}

impl RemoteEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::TrackChange(_) => "track_change",
            RemoteEvent::UserJoined { .. } => "user_joined",
            RemoteEvent::UserLeft { .. } => "user_left",
            RemoteEvent::JoinRequest { .. } => "join_request",
            RemoteEvent::JoinApproved { .. } => "join_approved",
            RemoteEvent::JoinRejected { .. } => "join_rejected",
            RemoteEvent::SessionEnded => "session_ended",
            RemoteEvent::SoundtrackPlay => "soundtrack_play",
            RemoteEvent::SoundtrackPause => "soundtrack_pause",
            RemoteEvent::QueueUpdate { .. } => "queue_update",
            RemoteEvent::Chat { .. } => "chat",
            RemoteEvent::Gift { .. } => "gift",
        }
    }

    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, RoomError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(RoomError::protocol)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, RoomError> {
        let Envelope { event, data } = envelope;
        let event = match event.as_str() {
            "track_change" => {
                if data.is_null() {
                    RemoteEvent::TrackChange(None)
                } else {
                    RemoteEvent::TrackChange(Some(payload(&event, data)?))
                }
            }
            "user_joined" => {
                let p: UserJoinedPayload = payload(&event, data)?;
                RemoteEvent::UserJoined {
                    id: p.user_id.into(),
                    role: p.role,
                }
            }
            "user_left" => RemoteEvent::UserLeft {
                id: user_id(&event, data)?,
            },
            "join_request" => RemoteEvent::JoinRequest {
                id: user_id(&event, data)?,
            },
            "join_approved" => RemoteEvent::JoinApproved {
                id: user_id(&event, data)?,
            },
            "join_rejected" => RemoteEvent::JoinRejected {
                id: user_id(&event, data)?,
            },
            "session_ended" => RemoteEvent::SessionEnded,
            "soundtrack_play" => RemoteEvent::SoundtrackPlay,
            "soundtrack_pause" => RemoteEvent::SoundtrackPause,
            "queue_update" => {
                let p: QueuePayload = payload(&event, data)?;
                RemoteEvent::QueueUpdate {
                    queue: p.queue.into_iter().map(Into::into).collect(),
                }
            }
            "chat" => {
                let p: ChatPayload = payload(&event, data)?;
                RemoteEvent::Chat {
                    user_id: p.user_id.map(Into::into),
                    display_name: p.display_name,
                    text: p.text,
                }
            }
            "gift" => {
                let p: GiftPayload = payload(&event, data)?;
                RemoteEvent::Gift {
                    user_id: p.user_id.map(Into::into),
                    display_name: p.display_name,
                    amount: p.amount,
                }
            }
            other => return Err(RoomError::Protocol(format!("unknown event '{other}'"))),
        };
        Ok(event)
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, RoomError> {
    serde_json::from_value(data)
        .map_err(|e| RoomError::Protocol(format!("invalid '{event}' payload: {e}")))
}

fn user_id(event: &str, data: Value) -> Result<ParticipantId, RoomError> {
    let p: UserPayload = payload(event, data)?;
    Ok(p.user_id.into())
}

/// Events this client emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    JoinRequest { user_id: ParticipantId },
    JoinApproved { user_id: ParticipantId },
    JoinRejected { user_id: ParticipantId },
    SoundtrackPlay,
    SoundtrackPause,
    Chat {
        user_id: ParticipantId,
        display_name: String,
        text: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRequest { .. } => "join_request",
            OutboundEvent::JoinApproved { .. } => "join_approved",
            OutboundEvent::JoinRejected { .. } => "join_rejected",
            OutboundEvent::SoundtrackPlay => "soundtrack_play",
            OutboundEvent::SoundtrackPause => "soundtrack_pause",
            OutboundEvent::Chat { .. } => "chat",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            OutboundEvent::JoinRequest { user_id }
            | OutboundEvent::JoinApproved { user_id }
            | OutboundEvent::JoinRejected { user_id } => serde_json::json!({ "userId": user_id }),
            OutboundEvent::SoundtrackPlay | OutboundEvent::SoundtrackPause => {
                serde_json::json!({})
            }
            OutboundEvent::Chat {
                user_id,
                display_name,
                text,
            } => serde_json::json!({
                "userId": user_id,
                "displayName": display_name,
                "text": text,
            }),
        };
        Envelope {
            event: self.name().to_string(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, RoomError> {
        serde_json::to_string(&self.to_envelope()).map_err(RoomError::protocol)
    }
}
