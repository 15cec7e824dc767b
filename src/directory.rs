use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::protocol::{ParticipantId, Role};
use crate::room::SelfIdentity;

#[async_trait::async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Identity of the room's host.
    async fn host_of(&self, room_id: &str) -> Result<ParticipantId>;
}

/// Durable mirror of socket decisions. The socket stays authoritative for
/// live state whatever these return.
#[async_trait::async_trait]
pub trait RoomApi: Send + Sync {
    async fn request_join(&self, room_id: &str) -> Result<()>;
    async fn approve(&self, room_id: &str, user_id: &str) -> Result<()>;
    async fn reject(&self, room_id: &str, user_id: &str) -> Result<()>;
    async fn end_session(&self, room_id: &str) -> Result<()>;
}

/// Host for a room known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    hosts: HashMap<String, ParticipantId>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_room(mut self, room_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        self.hosts.insert(room_id.into(), host_id.into());
        self
    }
}

#[async_trait::async_trait]
impl RoomDirectory for StaticDirectory {
    async fn host_of(&self, room_id: &str) -> Result<ParticipantId> {
        self.hosts
            .get(room_id)
            .cloned()
            .with_context(|| format!("Unknown room: {room_id}"))
    }
}

/// Keeps no durable record; the socket alone carries join decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOnly;

#[async_trait::async_trait]
impl RoomApi for SocketOnly {
    async fn request_join(&self, room_id: &str) -> Result<()> {
        crate::dlog!("[Api] request_join({room_id}) not persisted");
        Ok(())
    }

    async fn approve(&self, room_id: &str, user_id: &str) -> Result<()> {
        crate::dlog!("[Api] approve({room_id}, {user_id}) not persisted");
        Ok(())
    }

    async fn reject(&self, room_id: &str, user_id: &str) -> Result<()> {
        crate::dlog!("[Api] reject({room_id}, {user_id}) not persisted");
        Ok(())
    }

    async fn end_session(&self, room_id: &str) -> Result<()> {
        crate::dlog!("[Api] end_session({room_id}) not persisted");
        Ok(())
    }
}

/// Host when the directory names us, Guest otherwise.
pub fn resolve_role(host_id: &str, me: &SelfIdentity) -> Role {
    if me.is(host_id) {
        Role::Host
    } else {
        Role::Guest
    }
}
