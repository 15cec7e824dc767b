use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, RoomChannel};
use crate::directory::RoomApi;
use crate::error::RoomError;
use crate::media::{LocalStream, RemoteStream};
use crate::peer::{IncomingCall, PeerCall, PeerConnector, SessionOffer};
use crate::protocol::{OutboundEvent, RemoteEvent};

/// Shared, ordered record of side effects across fakes.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_for(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct ChannelInner {
    sink: Option<mpsc::Sender<ChannelEvent>>,
    room_id: Option<String>,
    sent: Vec<OutboundEvent>,
    refuse: bool,
}

#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Mutex<ChannelInner>>,
    journal: Journal,
}

impl MemoryChannel {
    pub fn new(journal: Journal) -> Self {
        Self {
            inner: Arc::default(),
            journal,
        }
    }

    pub fn refusing(self) -> Self {
        self.inner.lock().unwrap().refuse = true;
        self
    }

    pub async fn push(&self, event: RemoteEvent) {
        self.deliver(ChannelEvent::Message(event)).await;
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.deliver(ChannelEvent::Closed(reason.to_string())).await;
    }

    async fn deliver(&self, event: ChannelEvent) {
        let sink = self.inner.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            let _ = sink.send(event).await;
        }
    }

    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.lock().unwrap().room_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().sink.is_some()
    }
}

#[async_trait::async_trait]
impl RoomChannel for MemoryChannel {
    async fn connect(
        &mut self,
        room_id: &str,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), RoomError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse {
            return Err(RoomError::Transport("connection refused".to_string()));
        }
        inner.sink = Some(sink);
        inner.room_id = Some(room_id.to_string());
        Ok(())
    }

    fn send(&self, event: OutboundEvent) {
        self.inner.lock().unwrap().sent.push(event);
    }

    fn disconnect(&mut self) {
        if self.inner.lock().unwrap().sink.take().is_some() {
            note(&self.journal, "disconnect".to_string());
        }
    }
}

#[derive(Default)]
struct ConnectorInner {
    calls: Vec<String>,
    closed: Vec<String>,
    failing: Vec<String>,
    stalling: Vec<String>,
    incoming: Option<mpsc::UnboundedSender<IncomingCall>>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    inner: Arc<Mutex<ConnectorInner>>,
    journal: Journal,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn failing(self, peer_id: &str) -> Self {
        self.inner.lock().unwrap().failing.push(peer_id.to_string());
        self
    }

    pub fn stalling(self, peer_id: &str) -> Self {
        self.inner.lock().unwrap().stalling.push(peer_id.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.inner.lock().unwrap().closed.clone()
    }

    /// Simulate a remote peer calling us.
    pub fn ring(&self, peer_id: &str) -> bool {
        let incoming = self.inner.lock().unwrap().incoming.clone();
        incoming.is_some_and(|tx| {
            tx.send(IncomingCall {
                peer_id: peer_id.to_string(),
                offer: SessionOffer(format!("offer-from-{peer_id}")),
            })
            .is_ok()
        })
    }

    fn open(&self, peer_id: &str, entry: String) -> Result<Box<dyn PeerCall>, String> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(entry);
        if inner.failing.iter().any(|p| p == peer_id) {
            return Err(format!("{peer_id} unreachable"));
        }
        Ok(Box::new(FakeCall {
            peer_id: peer_id.to_string(),
            stall: inner.stalling.iter().any(|p| p == peer_id),
            connector: self.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl PeerConnector for FakeConnector {
    async fn listen(
        &self,
        _self_id: &str,
        incoming: mpsc::UnboundedSender<IncomingCall>,
    ) -> Result<(), String> {
        self.inner.lock().unwrap().incoming = Some(incoming);
        Ok(())
    }

    async fn call(&self, peer_id: &str, _local: &LocalStream) -> Result<Box<dyn PeerCall>, String> {
        self.open(peer_id, format!("call:{peer_id}"))
    }

    async fn answer(
        &self,
        peer_id: &str,
        _offer: SessionOffer,
        local: Option<&LocalStream>,
    ) -> Result<Box<dyn PeerCall>, String> {
        let entry = match local {
            Some(_) => format!("answer:{peer_id}"),
            None => format!("answer:{peer_id}:recvonly"),
        };
        self.open(peer_id, entry)
    }
}

struct FakeCall {
    peer_id: String,
    stall: bool,
    connector: FakeConnector,
}

#[async_trait::async_trait]
impl PeerCall for FakeCall {
    async fn remote_stream(&mut self) -> Option<RemoteStream> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        Some(RemoteStream {
            peer_id: self.peer_id.clone(),
            stream_id: format!("stream-{}", self.peer_id),
        })
    }

    async fn close(&mut self) {
        self.connector
            .inner
            .lock()
            .unwrap()
            .closed
            .push(self.peer_id.clone());
        note(&self.connector.journal, format!("close:{}", self.peer_id));
    }
}

/// Records every REST mirror call. `end_session` is recorded, then refused.
#[derive(Clone, Default)]
pub struct RecordingApi {
    pub actions: Arc<Mutex<Vec<String>>>,
}

impl RecordingApi {
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: String) -> Result<()> {
        self.actions.lock().unwrap().push(action);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoomApi for RecordingApi {
    async fn request_join(&self, room_id: &str) -> Result<()> {
        self.record(format!("request_join:{room_id}"))
    }

    async fn approve(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.record(format!("approve:{room_id}:{user_id}"))
    }

    async fn reject(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.record(format!("reject:{room_id}:{user_id}"))
    }

    async fn end_session(&self, room_id: &str) -> Result<()> {
        self.record(format!("end_session:{room_id}"))?;
        anyhow::bail!("end_session({room_id}) rejected by server")
    }
}
