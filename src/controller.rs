//! Orchestration boundary between the UI layer and one live room.
//!
//! [`RoomController`] owns the connection lifecycle. While a room is active a
//! single actor task owns the [`RoomState`], the [`RoomChannel`] and the
//! [`PeerSessionManager`]; socket events, UI intents, peer-session results
//! and media readiness all queue up on that task, so room state is only ever
//! touched from one place.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, RoomChannel};
use crate::directory::{resolve_role, RoomApi, RoomDirectory};
use crate::error::{CloseReason, MediaError, RoomError};
use crate::media::{LocalStream, MediaSource};
use crate::peer::{IncomingCall, PeerConnector, PeerEvent, PeerSessionManager};
use crate::protocol::ParticipantId;
use crate::room::{Command, Focus, Input, Intent, Playback, RoomSnapshot, RoomState, SelfIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Idle,
    Joining,
    Active,
    Leaving,
    Failed,
}

pub type ChannelFactory = Box<dyn Fn() -> Box<dyn RoomChannel> + Send + Sync>;

/// Everything the controller talks to outside this crate.
pub struct Collaborators {
    pub directory: Arc<dyn RoomDirectory>,
    pub api: Arc<dyn RoomApi>,
    pub media: Arc<dyn MediaSource>,
    pub connector: Arc<dyn PeerConnector>,
    /// Builds a fresh transport for each join.
    pub channels: ChannelFactory,
}

struct ActiveRoom {
    room_id: String,
    intents: mpsc::UnboundedSender<Intent>,
    snapshots: watch::Receiver<RoomSnapshot>,
    task: JoinHandle<()>,
}

pub struct RoomController {
    identity: SelfIdentity,
    deps: Collaborators,
    event_buffer: usize,
    lifecycle: Arc<Mutex<Lifecycle>>,
    active: tokio::sync::Mutex<Option<ActiveRoom>>,
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(|e| e.into_inner())
}

impl RoomController {
    pub fn new(identity: SelfIdentity, deps: Collaborators) -> Self {
        Self {
            identity,
            deps,
            event_buffer: 256,
            lifecycle: Arc::new(Mutex::new(Lifecycle::Idle)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    /// Resolve our role, open the room socket and start the room actor.
    ///
    /// Fails with [`RoomError::AlreadyJoined`] while another join is in
    /// flight or a room is active.
    pub async fn join_room(&self, room_id: &str) -> Result<RoomSnapshot, RoomError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Idle | Lifecycle::Failed => *lifecycle = Lifecycle::Joining,
                current => {
                    tracing::warn!("[Ctl] join_room({room_id}) rejected while {current:?}");
                    return Err(RoomError::AlreadyJoined(room_id.to_string()));
                }
            }
        }

        let mut slot = self.active.lock().await;
        if let Some(stale) = slot.take() {
            crate::dlog!("[Ctl] Discarding closed room {}", stale.room_id);
        }

        match self.open(room_id).await {
            Ok(active) => {
                let snapshot = active.snapshots.borrow().clone();
                *slot = Some(active);
                let mut lifecycle = lock(&self.lifecycle);
                if *lifecycle == Lifecycle::Joining {
                    *lifecycle = Lifecycle::Active;
                }
                Ok(snapshot)
            }
            Err(err) => {
                tracing::warn!("[Ctl] Failed to join {room_id}: {err}");
                *lock(&self.lifecycle) = match err {
                    RoomError::Transport(_) => Lifecycle::Failed,
                    _ => Lifecycle::Idle,
                };
                Err(err)
            }
        }
    }

    async fn open(&self, room_id: &str) -> Result<ActiveRoom, RoomError> {
        let host_id = self
            .deps
            .directory
            .host_of(room_id)
            .await
            .map_err(|e| RoomError::Directory(format!("{e:#}")))?;
        let role = resolve_role(&host_id, &self.identity);
        tracing::info!("[Ctl] Joining room {room_id} as {role:?}");

        let (channel_tx, channel_rx) = mpsc::channel(self.event_buffer);
        let mut channel = (self.deps.channels)();
        channel.connect(room_id, channel_tx).await?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        if let Err(err) = self.deps.connector.listen(&self.identity.id, incoming_tx).await {
            tracing::warn!("[Ctl] Not accepting incoming calls: {err}");
        }

        let state = RoomState::new(room_id, self.identity.clone(), role);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let actor = RoomActor {
            state,
            channel,
            peers: PeerSessionManager::new(self.deps.connector.clone(), peer_tx),
            media: self.deps.media.clone(),
            api: self.deps.api.clone(),
            media_tx,
            snapshots: snapshot_tx,
            lifecycle: self.lifecycle.clone(),
        };
        let inbox = Inbox {
            channel: channel_rx,
            intents: intent_rx,
            peers: peer_rx,
            incoming: incoming_rx,
            media: media_rx,
        };
        let task = tokio::spawn(actor.run(inbox));

        Ok(ActiveRoom {
            room_id: room_id.to_string(),
            intents: intent_tx,
            snapshots: snapshot_rx,
            task,
        })
    }

    /// Leave the room and wait until the channel is closed and every peer
    /// session has been told to shut down.
    pub async fn leave_room(&self) -> Result<(), RoomError> {
        let active = self.active.lock().await.take().ok_or(RoomError::NotJoined)?;
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Active {
                *lifecycle = Lifecycle::Leaving;
            }
        }
        let _ = active.intents.send(Intent::Leave);
        if let Err(err) = active.task.await {
            tracing::error!("[Ctl] Room {} task ended abnormally: {err}", active.room_id);
        }
        *lock(&self.lifecycle) = Lifecycle::Idle;
        tracing::info!("[Ctl] Left room {}", active.room_id);
        Ok(())
    }

    pub async fn request_to_join(&self) -> Result<(), RoomError> {
        self.dispatch(Intent::RequestToJoin).await
    }

    pub async fn accept_join_request(&self, id: impl Into<ParticipantId>) -> Result<(), RoomError> {
        self.dispatch(Intent::AcceptJoinRequest(id.into())).await
    }

    pub async fn reject_join_request(&self, id: impl Into<ParticipantId>) -> Result<(), RoomError> {
        self.dispatch(Intent::RejectJoinRequest(id.into())).await
    }

    pub async fn set_focus(&self, target: Focus) -> Result<(), RoomError> {
        self.dispatch(Intent::SetFocus(target)).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), RoomError> {
        self.dispatch(Intent::SendChat(text.into())).await
    }

    pub async fn set_playback(&self, playback: Playback) -> Result<(), RoomError> {
        self.dispatch(Intent::SetPlayback(playback)).await
    }

    pub async fn toggle_mic(&self) -> Result<(), RoomError> {
        self.dispatch(Intent::ToggleMic).await
    }

    pub async fn end_session(&self) -> Result<(), RoomError> {
        self.dispatch(Intent::EndSession).await
    }

    async fn dispatch(&self, intent: Intent) -> Result<(), RoomError> {
        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or(RoomError::NotJoined)?;
        if self.lifecycle() != Lifecycle::Active {
            return Err(RoomError::NotJoined);
        }
        active.intents.send(intent).map_err(|_| RoomError::NotJoined)
    }

    /// Latest room snapshot, if a room was joined.
    pub async fn snapshot(&self) -> Option<RoomSnapshot> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|a| a.snapshots.borrow().clone())
    }

    /// Follow snapshot changes for rendering.
    pub async fn subscribe(&self) -> Option<watch::Receiver<RoomSnapshot>> {
        let guard = self.active.lock().await;
        guard.as_ref().map(|a| a.snapshots.clone())
    }

    /// Why the current room closed, once it has.
    pub async fn closed(&self) -> Option<CloseReason> {
        self.snapshot().await.and_then(|s| s.closed)
    }
}

struct Inbox {
    channel: mpsc::Receiver<ChannelEvent>,
    intents: mpsc::UnboundedReceiver<Intent>,
    peers: mpsc::UnboundedReceiver<PeerEvent>,
    incoming: mpsc::UnboundedReceiver<IncomingCall>,
    media: mpsc::UnboundedReceiver<Result<LocalStream, MediaError>>,
}

#[derive(Debug)]
enum Persist {
    JoinRequest,
    Approval(ParticipantId),
    Rejection(ParticipantId),
    EndSession,
}

struct RoomActor {
    state: RoomState,
    channel: Box<dyn RoomChannel>,
    peers: PeerSessionManager,
    media: Arc<dyn MediaSource>,
    api: Arc<dyn RoomApi>,
    media_tx: mpsc::UnboundedSender<Result<LocalStream, MediaError>>,
    snapshots: watch::Sender<RoomSnapshot>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl RoomActor {
    async fn run(mut self, mut inbox: Inbox) {
        let start = self.state.start();
        self.execute(start);

        loop {
            let input = tokio::select! {
                event = inbox.channel.recv() => match event {
                    Some(ChannelEvent::Message(event)) => Input::Remote(event),
                    Some(ChannelEvent::Closed(reason)) => Input::TransportClosed(reason),
                    None => Input::TransportClosed("channel dropped".to_string()),
                },
                intent = inbox.intents.recv() => Input::Intent(intent.unwrap_or(Intent::Leave)),
                Some(event) = inbox.peers.recv() => match self.peer_input(event) {
                    Some(input) => input,
                    None => continue,
                },
                Some(call) = inbox.incoming.recv() => {
                    tracing::info!("[Ctl] Incoming call from {}", call.peer_id);
                    self.peers.accept_incoming(call);
                    continue;
                }
                Some(result) = inbox.media.recv() => {
                    self.on_media(result);
                    continue;
                }
            };

            let commands = self.state.apply(input);
            self.execute(commands);
            self.publish();
            if self.state.is_terminal() {
                break;
            }
        }
        crate::dlog!("[Ctl] Room {} actor stopped", self.state.room_id());
    }

    fn peer_input(&mut self, event: PeerEvent) -> Option<Input> {
        if !self.peers.is_live(event.peer_id(), event.session()) {
            crate::dlog!("[Ctl] Stale event from session {} with {}", event.session(), event.peer_id());
            return None;
        }
        match event {
            PeerEvent::StreamArrived { peer_id, .. } => Some(Input::StreamArrived(peer_id)),
            PeerEvent::Failed { peer_id, session, .. } => {
                self.peers.discard(&peer_id, session);
                Some(Input::SessionFailed(peer_id))
            }
        }
    }

    fn on_media(&mut self, result: Result<LocalStream, MediaError>) {
        match result {
            Ok(stream) => {
                stream.set_audio_enabled(self.state.mic_enabled());
                self.peers.local_media_ready(stream);
            }
            Err(err) => {
                tracing::warn!(
                    "[Ctl] Local media unavailable ({err}), {} call(s) left unplaced",
                    self.peers.queued_calls().len()
                );
                self.peers.local_media_failed();
            }
        }
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::OriginateCall(id) => self.peers.originate_call(&id),
                Command::TeardownSession(id) => self.peers.teardown_session(&id),
                Command::TeardownAll => self.peers.teardown_all(),
                Command::PrepareLocalMedia => self.prepare_media(),
                Command::SetMicEnabled(enabled) => self.peers.set_mic_enabled(enabled),
                Command::Send(event) => self.channel.send(event),
                Command::DisconnectChannel => self.channel.disconnect(),
                Command::PersistJoinRequest => self.persist(Persist::JoinRequest),
                Command::PersistApproval(id) => self.persist(Persist::Approval(id)),
                Command::PersistRejection(id) => self.persist(Persist::Rejection(id)),
                Command::PersistEndSession => self.persist(Persist::EndSession),
                Command::Closed(reason) => {
                    let next = match reason {
                        CloseReason::Transport(_) => Lifecycle::Failed,
                        CloseReason::Left | CloseReason::SessionEnded => Lifecycle::Idle,
                    };
                    *lock(&self.lifecycle) = next;
                    tracing::info!("[Ctl] Room {} closed: {reason}", self.state.room_id());
                }
            }
        }
    }

    fn prepare_media(&mut self) {
        if self.peers.has_local_media() {
            return;
        }
        self.peers.expect_local_media();
        let media = self.media.clone();
        let media_tx = self.media_tx.clone();
        tokio::spawn(async move {
            let _ = media_tx.send(media.acquire().await);
        });
    }

    fn persist(&self, action: Persist) {
        let api = self.api.clone();
        let room_id = self.state.room_id().to_string();
        tokio::spawn(async move {
            let result = match &action {
                Persist::JoinRequest => api.request_join(&room_id).await,
                Persist::Approval(id) => api.approve(&room_id, id).await,
                Persist::Rejection(id) => api.reject(&room_id, id).await,
                Persist::EndSession => api.end_session(&room_id).await,
            };
            if let Err(err) = result {
                tracing::warn!("[Ctl] Could not persist {action:?} for {room_id}: {err:#}");
            }
        });
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::media::StubMediaSource;
    use crate::protocol::{OutboundEvent, RemoteEvent, Role};
    use crate::room::Presence;
    use crate::testing::{wait_for, FakeConnector, Journal, MemoryChannel, RecordingApi};
    use std::time::Duration;

    struct Harness {
        controller: RoomController,
        channel: MemoryChannel,
        connector: FakeConnector,
        media: Arc<StubMediaSource>,
        api: RecordingApi,
        journal: Journal,
    }

    fn harness(media: StubMediaSource) -> Harness {
        harness_with(media, false)
    }

    fn harness_with(media: StubMediaSource, refuse: bool) -> Harness {
        let journal = Journal::default();
        let channel = MemoryChannel::new(journal.clone());
        let channel = if refuse { channel.refusing() } else { channel };
        let connector = FakeConnector::new().with_journal(journal.clone());
        let media = Arc::new(media);
        let api = RecordingApi::default();
        let factory_channel = channel.clone();
        let deps = Collaborators {
            directory: Arc::new(
                StaticDirectory::new()
                    .with_room("hosted", "me")
                    .with_room("open", "h1"),
            ),
            api: Arc::new(api.clone()),
            media: media.clone(),
            connector: Arc::new(connector.clone()),
            channels: Box::new(move || Box::new(factory_channel.clone()) as Box<dyn RoomChannel>),
        };
        Harness {
            controller: RoomController::new(SelfIdentity::new("me", "Me"), deps),
            channel,
            connector,
            media,
            api,
            journal,
        }
    }

    fn granted() -> StubMediaSource {
        StubMediaSource::granted(LocalStream::new("local", true))
    }

    async fn until(
        controller: &RoomController,
        pred: impl FnMut(&RoomSnapshot) -> bool,
    ) -> RoomSnapshot {
        let mut rx = controller.subscribe().await.expect("no active room");
        let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
            .await
            .expect("snapshot condition not reached")
            .expect("room actor stopped")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn host_join_resolves_role_and_prepares_media() {
        let h = harness(granted());
        let snapshot = h.controller.join_room("hosted").await.unwrap();
        assert_eq!(snapshot.self_role, Role::Host);
        assert_eq!(snapshot.focus, Focus::SelfView);
        assert_eq!(h.controller.lifecycle(), Lifecycle::Active);
        assert_eq!(h.channel.room_id().as_deref(), Some("hosted"));
        wait_for(|| h.media.was_requested()).await;
    }

    #[tokio::test]
    async fn second_join_is_rejected_while_active() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();
        let err = h.controller.join_room("open").await.unwrap_err();
        assert!(matches!(err, RoomError::AlreadyJoined(_)));
        let err = h.controller.join_room("hosted").await.unwrap_err();
        assert!(matches!(err, RoomError::AlreadyJoined(_)));
        assert_eq!(h.controller.lifecycle(), Lifecycle::Active);
    }

    #[tokio::test]
    async fn unknown_room_leaves_controller_idle() {
        let h = harness(granted());
        let err = h.controller.join_room("missing").await.unwrap_err();
        assert!(matches!(err, RoomError::Directory(_)));
        assert_eq!(h.controller.lifecycle(), Lifecycle::Idle);
        assert!(h.controller.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_fails_and_allows_retry() {
        let h = harness_with(granted(), true);
        let err = h.controller.join_room("open").await.unwrap_err();
        assert!(matches!(err, RoomError::Transport(_)));
        assert_eq!(h.controller.lifecycle(), Lifecycle::Failed);

        // Failed is not sticky: a new attempt runs the whole join again.
        let err = h.controller.join_room("open").await.unwrap_err();
        assert!(matches!(err, RoomError::Transport(_)));
    }

    #[tokio::test]
    async fn host_accepts_guest_end_to_end() {
        let h = harness(granted());
        h.controller.join_room("hosted").await.unwrap();

        h.channel
            .push(RemoteEvent::UserJoined {
                id: "u1".to_string(),
                role: Role::Guest,
            })
            .await;
        h.channel
            .push(RemoteEvent::JoinRequest {
                id: "u1".to_string(),
            })
            .await;
        until(&h.controller, |s| s.pending_join_requests == ["u1"]).await;

        h.controller.accept_join_request("u1").await.unwrap();
        let snapshot = until(&h.controller, |s| s.pending_join_requests.is_empty()).await;
        assert_eq!(snapshot.roster[0].role, Role::Performer);
        assert_eq!(
            h.channel.sent(),
            vec![OutboundEvent::JoinApproved {
                user_id: "u1".to_string()
            }]
        );
        wait_for(|| h.connector.calls() == vec!["call:u1".to_string()]).await;
        wait_for(|| h.api.actions() == vec!["approve:hosted:u1".to_string()]).await;
    }

    #[tokio::test]
    async fn guest_request_without_media_is_sent_once() {
        let h = harness(StubMediaSource::failing(MediaError::DeviceUnavailable));
        let snapshot = h.controller.join_room("open").await.unwrap();
        assert_eq!(snapshot.self_role, Role::Guest);

        h.controller.request_to_join().await.unwrap();
        h.channel
            .push(RemoteEvent::JoinRequest {
                id: "me".to_string(),
            })
            .await;
        until(&h.controller, |s| s.pending_join_requests == ["me"]).await;
        h.controller.request_to_join().await.unwrap();
        h.controller.send_chat("still here").await.unwrap();
        until(&h.controller, |s| s.messages.len() == 1).await;

        let requests: Vec<_> = h
            .channel
            .sent()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::JoinRequest { .. }))
            .collect();
        assert_eq!(requests.len(), 1);
        assert!(!h.media.was_requested());
    }

    #[tokio::test]
    async fn approval_places_queued_calls_once_media_is_ready() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "h1".to_string(),
                role: Role::Host,
            })
            .await;
        until(&h.controller, |s| s.roster.len() == 1).await;
        assert!(h.connector.calls().is_empty());

        h.channel
            .push(RemoteEvent::JoinApproved {
                id: "me".to_string(),
            })
            .await;
        until(&h.controller, |s| s.self_role == Role::Performer).await;
        wait_for(|| h.connector.calls() == vec!["call:h1".to_string()]).await;
        let snapshot = until(&h.controller, |s| s.remote_streams == ["h1"]).await;
        assert_eq!(snapshot.focus, Focus::Peer("h1".to_string()));
    }

    #[tokio::test]
    async fn call_ringing_before_user_joined_keeps_its_stream() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();

        assert!(h.connector.ring("h1"));
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "h1".to_string(),
                role: Role::Host,
            })
            .await;

        let snapshot = until(&h.controller, |s| s.remote_streams == ["h1"]).await;
        assert_eq!(snapshot.focus, Focus::Peer("h1".to_string()));
        assert_eq!(h.connector.calls(), vec!["answer:h1:recvonly".to_string()]);
    }

    #[tokio::test]
    async fn approved_performer_answers_with_local_media() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "h1".to_string(),
                role: Role::Host,
            })
            .await;
        h.channel
            .push(RemoteEvent::JoinApproved {
                id: "me".to_string(),
            })
            .await;
        until(&h.controller, |s| s.self_role == Role::Performer).await;

        assert!(h.connector.ring("h1"));
        wait_for(|| h.connector.calls().contains(&"answer:h1".to_string())).await;
        assert!(!h
            .connector
            .calls()
            .iter()
            .any(|c| c.ends_with(":recvonly")));
    }

    #[tokio::test]
    async fn incoming_stream_takes_focus_for_guest() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "p1".to_string(),
                role: Role::Performer,
            })
            .await;
        until(&h.controller, |s| s.roster.len() == 1).await;

        assert!(h.connector.ring("p1"));
        let snapshot = until(&h.controller, |s| s.focus == Focus::Peer("p1".to_string())).await;
        assert_eq!(snapshot.remote_streams, vec!["p1".to_string()]);
        assert_eq!(h.connector.calls(), vec!["answer:p1:recvonly".to_string()]);

        h.controller.set_focus(Focus::SelfView).await.unwrap();
        until(&h.controller, |s| s.focus == Focus::SelfView).await;
    }

    #[tokio::test]
    async fn failed_session_marks_participant_disconnected() {
        let h = harness(granted());
        let _ = h.connector.clone().failing("p1");
        h.controller.join_room("hosted").await.unwrap();
        wait_for(|| h.media.was_requested()).await;

        h.channel
            .push(RemoteEvent::UserJoined {
                id: "p1".to_string(),
                role: Role::Performer,
            })
            .await;
        let snapshot = until(&h.controller, |s| {
            s.roster
                .first()
                .is_some_and(|p| p.presence == Presence::Disconnected)
        })
        .await;
        assert_eq!(snapshot.focus, Focus::SelfView);
    }

    #[tokio::test]
    async fn session_ended_closes_room() {
        let h = harness(granted());
        h.controller.join_room("hosted").await.unwrap();
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "p1".to_string(),
                role: Role::Performer,
            })
            .await;
        wait_for(|| h.connector.calls() == vec!["call:p1".to_string()]).await;

        h.channel.push(RemoteEvent::SessionEnded).await;
        let snapshot = until(&h.controller, |s| s.closed.is_some()).await;
        assert_eq!(snapshot.closed, Some(CloseReason::SessionEnded));
        assert_eq!(h.controller.closed().await, Some(CloseReason::SessionEnded));
        wait_for(|| h.connector.closed() == vec!["p1".to_string()]).await;
        assert!(!h.channel.is_connected());
        wait_for(|| h.controller.lifecycle() == Lifecycle::Idle).await;

        assert!(matches!(
            h.controller.send_chat("anyone?").await,
            Err(RoomError::NotJoined)
        ));
        h.controller.join_room("open").await.unwrap();
    }

    #[tokio::test]
    async fn transport_loss_moves_to_failed() {
        let h = harness(granted());
        h.controller.join_room("open").await.unwrap();
        h.channel.drop_connection("connection reset").await;
        let snapshot = until(&h.controller, |s| s.closed.is_some()).await;
        assert_eq!(
            snapshot.closed,
            Some(CloseReason::Transport("connection reset".to_string()))
        );
        wait_for(|| h.controller.lifecycle() == Lifecycle::Failed).await;
    }

    #[tokio::test]
    async fn leave_disconnects_before_tearing_down_peers() {
        let h = harness(granted());
        h.controller.join_room("hosted").await.unwrap();
        h.channel
            .push(RemoteEvent::UserJoined {
                id: "p1".to_string(),
                role: Role::Performer,
            })
            .await;
        until(&h.controller, |s| s.remote_streams == ["p1"]).await;

        h.controller.leave_room().await.unwrap();
        assert_eq!(h.controller.lifecycle(), Lifecycle::Idle);
        wait_for(|| h.journal.lock().unwrap().len() == 2).await;
        assert_eq!(
            *h.journal.lock().unwrap(),
            vec!["disconnect".to_string(), "close:p1".to_string()]
        );
        assert!(h.controller.snapshot().await.is_none());
        assert!(matches!(
            h.controller.leave_room().await,
            Err(RoomError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn host_controls_playback_and_ends_session() {
        let h = harness(granted());
        h.controller.join_room("hosted").await.unwrap();
        h.controller.set_playback(Playback::Playing).await.unwrap();
        h.controller.toggle_mic().await.unwrap();
        until(&h.controller, |s| s.playback == Playback::Playing && !s.mic_enabled).await;

        h.controller.end_session().await.unwrap();
        until(&h.controller, |s| s.closed == Some(CloseReason::SessionEnded)).await;
        assert_eq!(h.channel.sent(), vec![OutboundEvent::SoundtrackPlay]);
        // A refused REST call is logged, never surfaced.
        wait_for(|| h.api.actions() == vec!["end_session:hosted".to_string()]).await;
    }
}
