use serde::Serialize;

/// Why local media could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media device unavailable")]
    DeviceUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// Connect, send or receive failure. Terminal for the room.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame that does not parse as a known event.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("room directory lookup failed: {0}")]
    Directory(String),
    #[error("cannot join {0}: a room is already joining or active")]
    AlreadyJoined(String),
    #[error("not in a room")]
    NotJoined,
}

impl RoomError {
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// The single "session ended" surface shown to the user. The variant is kept
/// for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    Left,
    SessionEnded,
    Transport(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Left => write!(f, "left the room"),
            CloseReason::SessionEnded => write!(f, "session ended by host"),
            CloseReason::Transport(detail) => write!(f, "connection lost: {detail}"),
        }
    }
}
