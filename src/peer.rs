//! Peer media sessions for one room.
//!
//! The peer-connection library sits behind [`PeerConnector`]. Each session
//! runs in its own task; its outcome is reported as a [`PeerEvent`] on the
//! sink handed to [`PeerSessionManager::new`], which the room actor drains
//! on the same loop that owns the room state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::media::{LocalStream, RemoteStream};
use crate::protocol::ParticipantId;

/// Opaque session description from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer(pub String);

#[derive(Debug)]
pub struct IncomingCall {
    pub peer_id: ParticipantId,
    pub offer: SessionOffer,
}

#[derive(Debug)]
pub enum PeerEvent {
    StreamArrived {
        peer_id: ParticipantId,
        session: u64,
        stream: RemoteStream,
    },
    Failed {
        peer_id: ParticipantId,
        session: u64,
        error: String,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::StreamArrived { peer_id, .. } | PeerEvent::Failed { peer_id, .. } => peer_id,
        }
    }

    pub fn session(&self) -> u64 {
        match self {
            PeerEvent::StreamArrived { session, .. } | PeerEvent::Failed { session, .. } => *session,
        }
    }
}

/// One established point-to-point media connection.
#[async_trait::async_trait]
pub trait PeerCall: Send {
    /// Resolves once remote media arrives, or `None` if the call ended first.
    async fn remote_stream(&mut self) -> Option<RemoteStream>;

    async fn close(&mut self);
}

#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync {
    /// Start accepting calls addressed to `self_id`.
    async fn listen(
        &self,
        _self_id: &str,
        _incoming: mpsc::UnboundedSender<IncomingCall>,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn call(&self, peer_id: &str, local: &LocalStream) -> Result<Box<dyn PeerCall>, String>;

    /// Answer an offer. Without local media the answer is receive-only.
    async fn answer(
        &self,
        peer_id: &str,
        offer: SessionOffer,
        local: Option<&LocalStream>,
    ) -> Result<Box<dyn PeerCall>, String>;
}

/// Connector for builds without a media transport. Every call fails, so
/// participants show up as disconnected while room signaling keeps working.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalingOnly;

#[async_trait::async_trait]
impl PeerConnector for SignalingOnly {
    async fn call(&self, peer_id: &str, _local: &LocalStream) -> Result<Box<dyn PeerCall>, String> {
        Err(format!("no media transport to reach {peer_id}"))
    }

    async fn answer(
        &self,
        peer_id: &str,
        _offer: SessionOffer,
        _local: Option<&LocalStream>,
    ) -> Result<Box<dyn PeerCall>, String> {
        Err(format!("no media transport to answer {peer_id}"))
    }
}

enum SessionStart {
    Outbound(LocalStream),
    Inbound {
        offer: SessionOffer,
        local: Option<LocalStream>,
    },
}

struct Session {
    id: u64,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Session {
    fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct PeerSessionManager {
    connector: Arc<dyn PeerConnector>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    sessions: HashMap<ParticipantId, Session>,
    queued: Vec<ParticipantId>,
    /// Offers waiting for local media that is being acquired.
    held_offers: Vec<IncomingCall>,
    awaiting_media: bool,
    local_stream: Option<LocalStream>,
    next_session: u64,
}

impl PeerSessionManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            connector,
            events_tx,
            sessions: HashMap::new(),
            queued: Vec::new(),
            held_offers: Vec::new(),
            awaiting_media: false,
            local_stream: None,
            next_session: 0,
        }
    }

    /// Call `peer_id` now, or once local media is ready.
    pub fn originate_call(&mut self, peer_id: &str) {
        let held = self.held_offers.iter().any(|c| c.peer_id == peer_id);
        if held || self.sessions.contains_key(peer_id) {
            crate::dlog!("[Peer] Session with {peer_id} already exists");
            return;
        }
        match self.local_stream.clone() {
            Some(stream) => self.spawn_session(peer_id, SessionStart::Outbound(stream)),
            None => {
                if !self.queued.iter().any(|p| p == peer_id) {
                    tracing::info!("[Peer] No local media yet, queueing call to {peer_id}");
                    self.queued.push(peer_id.to_string());
                }
            }
        }
    }

    /// Answer an incoming call. While local media is still being acquired
    /// the offer is held and answered once media is ready, so the caller
    /// receives our stream.
    pub fn accept_incoming(&mut self, call: IncomingCall) {
        self.queued.retain(|p| *p != call.peer_id);
        self.held_offers.retain(|c| c.peer_id != call.peer_id);
        if let Some(old) = self.sessions.remove(&call.peer_id) {
            crate::dlog!("[Peer] Replacing session {} with {}", old.id, call.peer_id);
            old.close();
        }
        if self.awaiting_media && self.local_stream.is_none() {
            crate::dlog!("[Peer] Holding offer from {} until local media is ready", call.peer_id);
            self.held_offers.push(call);
            return;
        }
        self.answer(call);
    }

    /// Local media is being acquired.
    pub fn expect_local_media(&mut self) {
        if self.local_stream.is_none() {
            self.awaiting_media = true;
        }
    }

    /// Local media became available: answer held offers, then place every
    /// queued call.
    pub fn local_media_ready(&mut self, stream: LocalStream) {
        tracing::info!(
            "[Peer] Local media {} ready (video: {}), placing {} queued call(s)",
            stream.id(),
            stream.has_video(),
            self.queued.len() + self.held_offers.len()
        );
        self.awaiting_media = false;
        self.local_stream = Some(stream);
        for call in std::mem::take(&mut self.held_offers) {
            self.answer(call);
        }
        for peer_id in std::mem::take(&mut self.queued) {
            self.originate_call(&peer_id);
        }
    }

    /// Local media will not come. Held offers are answered receive-only;
    /// queued calls stay unplaced.
    pub fn local_media_failed(&mut self) {
        self.awaiting_media = false;
        for call in std::mem::take(&mut self.held_offers) {
            self.answer(call);
        }
    }

    fn answer(&mut self, call: IncomingCall) {
        let IncomingCall { peer_id, offer } = call;
        let local = self.local_stream.clone();
        self.spawn_session(&peer_id, SessionStart::Inbound { offer, local });
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        if let Some(stream) = &self.local_stream {
            stream.set_audio_enabled(enabled);
        }
    }

    pub fn teardown_session(&mut self, peer_id: &str) {
        self.queued.retain(|p| p != peer_id);
        self.held_offers.retain(|c| c.peer_id != peer_id);
        if let Some(session) = self.sessions.remove(peer_id) {
            crate::dlog!("[Peer] Tearing down session {} with {peer_id}", session.id);
            session.close();
        }
    }

    /// Close every session, drop queued calls and release local media.
    pub fn teardown_all(&mut self) {
        if !self.sessions.is_empty() {
            tracing::info!("[Peer] Tearing down {} session(s)", self.sessions.len());
        }
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.queued.clear();
        self.held_offers.clear();
        self.awaiting_media = false;
        self.local_stream = None;
    }

    /// Whether an event from `session` still belongs to the live session
    /// with `peer_id`.
    pub fn is_live(&self, peer_id: &str, session: u64) -> bool {
        self.sessions.get(peer_id).is_some_and(|s| s.id == session)
    }

    /// Forget a session that ended on its own.
    pub fn discard(&mut self, peer_id: &str, session: u64) {
        if self.is_live(peer_id, session) {
            self.sessions.remove(peer_id);
        }
    }

    pub fn has_local_media(&self) -> bool {
        self.local_stream.is_some()
    }

    pub fn queued_calls(&self) -> &[ParticipantId] {
        &self.queued
    }

    pub fn session_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<_> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn spawn_session(&mut self, peer_id: &str, start: SessionStart) {
        let id = self.next_session;
        self.next_session += 1;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.sessions.insert(
            peer_id.to_string(),
            Session {
                id,
                shutdown_tx: Some(shutdown_tx),
            },
        );
        tokio::spawn(run_session(
            self.connector.clone(),
            peer_id.to_string(),
            id,
            start,
            self.events_tx.clone(),
            shutdown_rx,
        ));
    }
}

impl Drop for PeerSessionManager {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

async fn run_session(
    connector: Arc<dyn PeerConnector>,
    peer_id: ParticipantId,
    session: u64,
    start: SessionStart,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let connect = async {
        match &start {
            SessionStart::Outbound(local) => {
                crate::dlog!("[Peer] Calling {peer_id}");
                connector.call(&peer_id, local).await
            }
            SessionStart::Inbound { offer, local } => {
                crate::dlog!("[Peer] Answering {peer_id}");
                connector.answer(&peer_id, offer.clone(), local.as_ref()).await
            }
        }
    };

    let connected = tokio::select! {
        biased;
        _ = &mut shutdown_rx => {
            crate::dlog!("[Peer] Call to {peer_id} abandoned before connecting");
            return;
        }
        result = connect => result,
    };

    let mut call = match connected {
        Ok(call) => call,
        Err(error) => {
            tracing::warn!("[Peer] Session with {peer_id} failed: {error}");
            let _ = events_tx.send(PeerEvent::Failed {
                peer_id,
                session,
                error,
            });
            return;
        }
    };

    tokio::select! {
        biased;
        _ = &mut shutdown_rx => {
            call.close().await;
            return;
        }
        stream = call.remote_stream() => match stream {
            Some(stream) => {
                tracing::info!("[Peer] Stream {} arrived from {peer_id}", stream.stream_id);
                let _ = events_tx.send(PeerEvent::StreamArrived {
                    peer_id: peer_id.clone(),
                    session,
                    stream,
                });
            }
            None => {
                let _ = events_tx.send(PeerEvent::Failed {
                    peer_id,
                    session,
                    error: "call ended before media arrived".to_string(),
                });
                call.close().await;
                return;
            }
        },
    }

    // Hold the call open until the room tears it down.
    let _ = shutdown_rx.await;
    crate::dlog!("[Peer] Closing session with {peer_id}");
    call.close().await;
}
