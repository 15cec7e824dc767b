//! Authoritative state of one karaoke room.
//!
//! [`RoomState::apply`] is the only way to mutate the room. Socket events,
//! local user intents and peer-session notifications all enter through it,
//! and it answers with [`Command`]s for the controller to execute. Nothing
//! here performs I/O.

use serde::Serialize;

use crate::error::CloseReason;
use crate::protocol::{OutboundEvent, ParticipantId, RemoteEvent, Role, Song};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub presence: Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Playback {
    Playing,
    Paused,
}

/// Whose stream is the main view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Focus {
    SelfView,
    Peer(ParticipantId),
    Unset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Gift,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub seq: u64,
    pub kind: MessageKind,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gift_amount: Option<u64>,
}

/// The local participant. A user may be addressed by more than one id
/// (profile id and wallet address), all of which mean "self".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    pub id: ParticipantId,
    pub aliases: Vec<ParticipantId>,
    pub display_name: String,
}

impl SelfIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aliases: Vec::new(),
            display_name: display_name.into(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn is(&self, id: &str) -> bool {
        self.id == id || self.aliases.iter().any(|a| a == id)
    }
}

/// Actions requested by the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    RequestToJoin,
    AcceptJoinRequest(ParticipantId),
    RejectJoinRequest(ParticipantId),
    SetFocus(Focus),
    SendChat(String),
    SetPlayback(Playback),
    ToggleMic,
    EndSession,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Remote(RemoteEvent),
    Intent(Intent),
    /// Media from this peer started flowing.
    StreamArrived(ParticipantId),
    /// The peer session to this participant failed or ended on its own.
    SessionFailed(ParticipantId),
    TransportClosed(String),
}

/// Side effects for the controller to carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OriginateCall(ParticipantId),
    TeardownSession(ParticipantId),
    TeardownAll,
    PrepareLocalMedia,
    SetMicEnabled(bool),
    Send(OutboundEvent),
    DisconnectChannel,
    PersistJoinRequest,
    PersistApproval(ParticipantId),
    PersistRejection(ParticipantId),
    PersistEndSession,
    Closed(CloseReason),
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub self_id: ParticipantId,
    pub self_role: Role,
    pub roster: Vec<Participant>,
    pub pending_join_requests: Vec<ParticipantId>,
    pub current_song: Option<Song>,
    pub playback: Playback,
    pub focus: Focus,
    pub queue: Vec<String>,
    pub remote_streams: Vec<ParticipantId>,
    pub messages: Vec<ChatMessage>,
    pub mic_enabled: bool,
    pub closed: Option<CloseReason>,
}

pub struct RoomState {
    room_id: String,
    me: SelfIdentity,
    self_role: Role,
    /// Remote participants in arrival order. Self is tracked separately.
    roster: Vec<Participant>,
    pending: Vec<ParticipantId>,
    current_song: Option<Song>,
    playback: Playback,
    focus: Focus,
    queue: Vec<String>,
    remote_streams: Vec<ParticipantId>,
    /// Streams that arrived before their sender was a connected performer.
    early_streams: Vec<ParticipantId>,
    messages: Vec<ChatMessage>,
    next_seq: u64,
    mic_enabled: bool,
    closed: Option<CloseReason>,
}

impl RoomState {
    pub fn new(room_id: impl Into<String>, me: SelfIdentity, self_role: Role) -> Self {
        let focus = if self_role == Role::Host {
            Focus::SelfView
        } else {
            Focus::Unset
        };
        Self {
            room_id: room_id.into(),
            me,
            self_role,
            roster: Vec::new(),
            pending: Vec::new(),
            current_song: None,
            playback: Playback::Paused,
            focus,
            queue: Vec::new(),
            remote_streams: Vec::new(),
            early_streams: Vec::new(),
            messages: Vec::new(),
            next_seq: 0,
            mic_enabled: true,
            closed: None,
        }
    }

    /// Commands to run once the room is live.
    pub fn start(&self) -> Vec<Command> {
        if self.self_role.transmits_media() {
            vec![Command::PrepareLocalMedia]
        } else {
            Vec::new()
        }
    }

    pub fn apply(&mut self, input: Input) -> Vec<Command> {
        if let Some(reason) = &self.closed {
            crate::dlog!("[Room] {} closed ({reason}), ignoring {input:?}", self.room_id);
            return Vec::new();
        }

        let mut out = Vec::new();
        match input {
            Input::Remote(event) => self.on_remote(event, &mut out),
            Input::Intent(intent) => self.on_intent(intent, &mut out),
            Input::StreamArrived(id) => self.on_stream_arrived(id),
            Input::SessionFailed(id) => self.on_session_failed(id, &mut out),
            Input::TransportClosed(detail) => {
                self.close(CloseReason::Transport(detail), &mut out)
            }
        }
        self.adopt_early_streams();
        self.repair_focus();
        out
    }

    fn on_remote(&mut self, event: RemoteEvent, out: &mut Vec<Command>) {
        match event {
            RemoteEvent::UserJoined { id, role } => self.on_user_joined(id, role, out),
            RemoteEvent::UserLeft { id } => self.on_user_left(id, out),
            RemoteEvent::JoinRequest { id } => self.on_join_request(id),
            RemoteEvent::JoinApproved { id } => self.on_join_approved(id, out),
            RemoteEvent::JoinRejected { id } => {
                if self.me.is(&id) {
                    let me = self.me.id.clone();
                    self.pending.retain(|p| *p != me);
                    self.system_message("Your request to perform was declined".to_string());
                } else {
                    self.pending.retain(|p| *p != id);
                }
            }
            RemoteEvent::TrackChange(song) => self.current_song = song,
            RemoteEvent::SoundtrackPlay => self.playback = Playback::Playing,
            RemoteEvent::SoundtrackPause => self.playback = Playback::Paused,
            RemoteEvent::QueueUpdate { queue } => self.queue = queue,
            RemoteEvent::SessionEnded => self.close(CloseReason::SessionEnded, out),
            RemoteEvent::Chat {
                user_id,
                display_name,
                text,
            } => {
                if user_id.as_deref().is_some_and(|id| self.me.is(id)) {
                    // Own message echoed back; already logged locally.
                    return;
                }
                let user_id = user_id.unwrap_or_else(|| "anon".to_string());
                let display_name = display_name.unwrap_or_else(|| short_id(&user_id));
                self.push_message(MessageKind::Chat, user_id, display_name, text, None);
            }
            RemoteEvent::Gift {
                user_id,
                display_name,
                amount,
            } => {
                let user_id = user_id.unwrap_or_else(|| "anon".to_string());
                let display_name = display_name.unwrap_or_else(|| short_id(&user_id));
                let text = format!("sent {amount}");
                self.push_message(MessageKind::Gift, user_id, display_name, text, Some(amount));
            }
        }
    }

    fn on_user_joined(&mut self, id: ParticipantId, role: Role, out: &mut Vec<Command>) {
        if self.me.is(&id) {
            crate::dlog!("[Room] Ignoring user_joined for self");
            return;
        }
        if let Some(existing) = self.roster.iter_mut().find(|p| p.id == id) {
            if existing.presence == Presence::Disconnected {
                existing.presence = Presence::Connected;
                if existing.role.transmits_media() {
                    out.push(Command::OriginateCall(id));
                }
            } else {
                crate::dlog!("[Room] Duplicate user_joined for {id}");
            }
            return;
        }

        let role = if role == Role::Host && self.has_host() {
            tracing::warn!("[Room] Second host {id} announced, treating as performer");
            Role::Performer
        } else {
            role
        };
        self.roster.push(Participant {
            id: id.clone(),
            role,
            presence: Presence::Connected,
        });
        if role.transmits_media() {
            self.pending.retain(|p| *p != id);
            out.push(Command::OriginateCall(id.clone()));
        }
        self.system_message(format!("{} joined", short_id(&id)));
    }

    fn on_user_left(&mut self, id: ParticipantId, out: &mut Vec<Command>) {
        if self.me.is(&id) {
            crate::dlog!("[Room] Ignoring user_left for self");
            return;
        }
        let was_pending = self.pending.contains(&id);
        self.pending.retain(|p| *p != id);
        self.early_streams.retain(|p| *p != id);

        let Some(pos) = self.roster.iter().position(|p| p.id == id) else {
            if !was_pending {
                crate::dlog!("[Room] user_left for unknown {id}");
            }
            return;
        };
        self.roster.remove(pos);
        self.remote_streams.retain(|p| *p != id);
        if self.focus == Focus::Peer(id.clone()) {
            self.focus = self.fallback_focus();
        }
        self.system_message(format!("{} left", short_id(&id)));
        out.push(Command::TeardownSession(id));
    }

    fn on_join_request(&mut self, id: ParticipantId) {
        let id = if self.me.is(&id) {
            if self.self_role != Role::Guest {
                return;
            }
            self.me.id.clone()
        } else {
            if self.role_of(&id).is_some_and(Role::transmits_media) {
                crate::dlog!("[Room] join_request from {id} who already performs");
                return;
            }
            id
        };
        if !self.pending.contains(&id) {
            self.pending.push(id);
        }
    }

    fn on_join_approved(&mut self, id: ParticipantId, out: &mut Vec<Command>) {
        if self.me.is(&id) {
            let me = self.me.id.clone();
            self.pending.retain(|p| *p != me);
            if self.self_role == Role::Guest {
                self.self_role = Role::Performer;
                self.system_message("You can now perform live".to_string());
                out.push(Command::PrepareLocalMedia);
            }
            return;
        }
        if self.promote(&id, out) {
            self.pending.retain(|p| *p != id);
        }
    }

    /// Guest to Performer. Returns false when `id` is not in the roster.
    fn promote(&mut self, id: &str, out: &mut Vec<Command>) -> bool {
        let Some(participant) = self.roster.iter_mut().find(|p| p.id == id) else {
            crate::dlog!("[Room] Cannot promote {id}: not in roster");
            return false;
        };
        if participant.role == Role::Guest {
            participant.role = Role::Performer;
            if self.self_role.transmits_media() && participant.presence == Presence::Connected {
                out.push(Command::OriginateCall(participant.id.clone()));
            }
        }
        true
    }

    fn on_stream_arrived(&mut self, id: ParticipantId) {
        if self.me.is(&id) {
            return;
        }
        if !self.is_focusable(&id) {
            crate::dlog!("[Room] Holding stream from {id} until they perform");
            if !self.early_streams.contains(&id) {
                self.early_streams.push(id);
            }
            return;
        }
        if !self.remote_streams.contains(&id) {
            self.remote_streams.push(id.clone());
        }
        if self.focus == Focus::Unset {
            self.focus = Focus::Peer(id);
        }
    }

    fn on_session_failed(&mut self, id: ParticipantId, out: &mut Vec<Command>) {
        self.early_streams.retain(|p| *p != id);
        let Some(participant) = self.roster.iter_mut().find(|p| p.id == id) else {
            return;
        };
        participant.presence = Presence::Disconnected;
        self.remote_streams.retain(|p| *p != id);
        out.push(Command::TeardownSession(id));
    }

    fn on_intent(&mut self, intent: Intent, out: &mut Vec<Command>) {
        match intent {
            Intent::RequestToJoin => {
                if self.self_role != Role::Guest {
                    crate::dlog!("[Room] requestToJoin ignored, already {:?}", self.self_role);
                    return;
                }
                if self.pending.contains(&self.me.id) {
                    crate::dlog!("[Room] requestToJoin ignored, request already pending");
                    return;
                }
                out.push(Command::Send(OutboundEvent::JoinRequest {
                    user_id: self.me.id.clone(),
                }));
                out.push(Command::PersistJoinRequest);
            }
            Intent::AcceptJoinRequest(id) => {
                if !self.host_may_decide(&id) {
                    return;
                }
                self.pending.retain(|p| *p != id);
                out.push(Command::Send(OutboundEvent::JoinApproved {
                    user_id: id.clone(),
                }));
                out.push(Command::PersistApproval(id.clone()));
                self.promote(&id, out);
            }
            Intent::RejectJoinRequest(id) => {
                if !self.host_may_decide(&id) {
                    return;
                }
                self.pending.retain(|p| *p != id);
                out.push(Command::Send(OutboundEvent::JoinRejected {
                    user_id: id.clone(),
                }));
                out.push(Command::PersistRejection(id));
            }
            Intent::SetFocus(target) => match target {
                Focus::SelfView => self.focus = Focus::SelfView,
                Focus::Peer(id) if self.is_focusable(&id) => self.focus = Focus::Peer(id),
                other => crate::dlog!("[Room] Refusing focus on {other:?}"),
            },
            Intent::SendChat(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                let user_id = self.me.id.clone();
                let display_name = self.me.display_name.clone();
                self.push_message(
                    MessageKind::Chat,
                    user_id.clone(),
                    display_name.clone(),
                    text.to_string(),
                    None,
                );
                out.push(Command::Send(OutboundEvent::Chat {
                    user_id,
                    display_name,
                    text: text.to_string(),
                }));
            }
            Intent::SetPlayback(playback) => {
                if self.self_role != Role::Host || self.playback == playback {
                    return;
                }
                self.playback = playback;
                out.push(Command::Send(match playback {
                    Playback::Playing => OutboundEvent::SoundtrackPlay,
                    Playback::Paused => OutboundEvent::SoundtrackPause,
                }));
            }
            Intent::ToggleMic => {
                if !self.self_role.transmits_media() {
                    return;
                }
                self.mic_enabled = !self.mic_enabled;
                out.push(Command::SetMicEnabled(self.mic_enabled));
            }
            Intent::EndSession => {
                if self.self_role != Role::Host {
                    crate::dlog!("[Room] Only the host can end the session");
                    return;
                }
                out.push(Command::PersistEndSession);
                self.close(CloseReason::SessionEnded, out);
            }
            Intent::Leave => self.close(CloseReason::Left, out),
        }
    }

    fn host_may_decide(&self, id: &str) -> bool {
        if self.self_role != Role::Host {
            crate::dlog!("[Room] Only the host can answer join requests");
            return false;
        }
        if !self.pending.iter().any(|p| p == id) {
            crate::dlog!("[Room] No pending request from {id}");
            return false;
        }
        true
    }

    fn close(&mut self, reason: CloseReason, out: &mut Vec<Command>) {
        tracing::info!("[Room] {} closing: {reason}", self.room_id);
        out.push(Command::DisconnectChannel);
        out.push(Command::TeardownAll);
        out.push(Command::Closed(reason.clone()));
        self.closed = Some(reason);
    }

    fn has_host(&self) -> bool {
        self.self_role == Role::Host || self.roster.iter().any(|p| p.role == Role::Host)
    }

    fn role_of(&self, id: &str) -> Option<Role> {
        self.roster.iter().find(|p| p.id == id).map(|p| p.role)
    }

    fn is_focusable(&self, id: &str) -> bool {
        self.roster
            .iter()
            .any(|p| p.id == id && p.role.transmits_media() && p.presence == Presence::Connected)
    }

    fn fallback_focus(&self) -> Focus {
        self.roster
            .iter()
            .find(|p| p.role.transmits_media() && p.presence == Presence::Connected)
            .map(|p| Focus::Peer(p.id.clone()))
            .unwrap_or(Focus::SelfView)
    }

    fn adopt_early_streams(&mut self) {
        let ready: Vec<ParticipantId> = self
            .early_streams
            .iter()
            .filter(|id| self.is_focusable(id))
            .cloned()
            .collect();
        for id in ready {
            self.early_streams.retain(|p| *p != id);
            self.on_stream_arrived(id);
        }
    }

    fn repair_focus(&mut self) {
        if let Focus::Peer(id) = &self.focus {
            if !self.is_focusable(id) {
                self.focus = self.fallback_focus();
            }
        }
    }

    fn system_message(&mut self, text: String) {
        self.push_message(MessageKind::System, "system".to_string(), String::new(), text, None);
    }

    fn push_message(
        &mut self,
        kind: MessageKind,
        user_id: String,
        display_name: String,
        text: String,
        gift_amount: Option<u64>,
    ) {
        self.messages.push(ChatMessage {
            seq: self.next_seq,
            kind,
            user_id,
            display_name,
            text,
            gift_amount,
        });
        self.next_seq += 1;
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.me
    }

    pub fn self_role(&self) -> Role {
        self.self_role
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.roster.iter().find(|p| p.id == id)
    }

    pub fn pending_join_requests(&self) -> &[ParticipantId] {
        &self.pending
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.current_song.as_ref()
    }

    pub fn playback(&self) -> Playback {
        self.playback
    }

    pub fn focus(&self) -> &Focus {
        &self.focus
    }

    pub fn queue(&self) -> &[String] {
        &self.queue
    }

    pub fn remote_streams(&self) -> &[ParticipantId] {
        &self.remote_streams
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled
    }

    pub fn is_terminal(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            self_id: self.me.id.clone(),
            self_role: self.self_role,
            roster: self.roster.clone(),
            pending_join_requests: self.pending.clone(),
            current_song: self.current_song.clone(),
            playback: self.playback,
            focus: self.focus.clone(),
            queue: self.queue.clone(),
            remote_streams: self.remote_streams.clone(),
            messages: self.messages.clone(),
            mic_enabled: self.mic_enabled,
            closed: self.closed.clone(),
        }
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(6).collect()
}
