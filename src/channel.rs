//! Per-room event transport. Retry policy, if any, belongs to the controller.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};

use crate::error::RoomError;
use crate::protocol::{OutboundEvent, RemoteEvent};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(RemoteEvent),
    /// The connection is gone and will not come back.
    Closed(String),
}

#[async_trait::async_trait]
pub trait RoomChannel: Send {
    /// Open the transport for `room_id` and start delivering events to `sink`
    /// in the order they arrive.
    async fn connect(
        &mut self,
        room_id: &str,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), RoomError>;

    /// Best-effort send. Dropped when not connected.
    fn send(&self, event: OutboundEvent);

    /// Close the transport. Safe to call any number of times.
    fn disconnect(&mut self);
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// [`RoomChannel`] over a WebSocket at `{ws_url}/karaoke/ws/join/{room_id}`.
pub struct WsRoomChannel {
    ws_url: String,
    auth_token: Option<String>,
    ping_interval: Duration,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WsRoomChannel {
    pub fn new(ws_url: String, auth_token: Option<String>, ping_interval: Duration) -> Self {
        Self {
            ws_url: ws_url.trim().trim_end_matches('/').to_string(),
            auth_token,
            ping_interval,
            outbound: None,
            shutdown_tx: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.ws_url.clone(),
            settings.auth_token.clone(),
            settings.ping_interval(),
        )
    }

    pub fn endpoint(&self, room_id: &str) -> String {
        format!("{}/karaoke/ws/join/{}", self.ws_url, room_id)
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait::async_trait]
impl RoomChannel for WsRoomChannel {
    async fn connect(
        &mut self,
        room_id: &str,
        sink: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), RoomError> {
        self.disconnect();

        let endpoint = self.endpoint(room_id);
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| RoomError::Transport(format!("Failed to build websocket request: {e}")))?;
        if let Some(token) = &self.auth_token {
            request.headers_mut().insert(
                http::header::AUTHORIZATION,
                http::HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| RoomError::Transport(format!("Invalid auth header: {e}")))?,
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RoomError::Transport(format!("Failed to connect websocket: {e}")))?;
        tracing::info!("[WS] Connected to {endpoint}");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(run_socket(
            ws,
            sink,
            outbound_rx,
            shutdown_rx,
            self.ping_interval,
        ));
        self.outbound = Some(outbound_tx);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    fn send(&self, event: OutboundEvent) {
        let Some(outbound) = &self.outbound else {
            crate::dlog!("[WS] Not connected, dropping {}", event.name());
            return;
        };
        match event.to_json() {
            Ok(text) => {
                if outbound.send(text).is_err() {
                    crate::dlog!("[WS] Socket gone, dropping {}", event.name());
                }
            }
            Err(err) => tracing::warn!("[WS] Could not encode {}: {err}", event.name()),
        }
    }

    fn disconnect(&mut self) {
        self.outbound = None;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

enum Frame {
    Event(RemoteEvent),
    Skip,
    Close(String),
}

fn decode_frame(msg: Message) -> Frame {
    let text = match msg {
        Message::Text(text) => text.to_string(),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("[WS] Dropping non-utf8 frame: {err}");
                return Frame::Skip;
            }
        },
        Message::Close(frame) => {
            let reason = frame
                .map(|f| f.reason.to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "closed by server".to_string());
            return Frame::Close(reason);
        }
        _ => return Frame::Skip,
    };
    match RemoteEvent::parse(&text) {
        Ok(event) => Frame::Event(event),
        Err(err) => {
            tracing::warn!("[WS] Dropping frame: {err}");
            Frame::Skip
        }
    }
}

async fn run_socket(
    mut ws: WsStream,
    sink: mpsc::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = ws.close(None).await;
                crate::dlog!("[WS] Closed by client");
                return;
            }
            _ = ping.tick() => {
                if let Err(err) = ws.send(Message::Ping(Vec::new().into())).await {
                    break format!("ping failed: {err}");
                }
            }
            text = outbound_rx.recv() => {
                let Some(text) = text else {
                    let _ = ws.close(None).await;
                    return;
                };
                if let Err(err) = ws.send(Message::Text(text.into())).await {
                    break format!("send failed: {err}");
                }
            }
            msg = ws.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => break format!("read failed: {err}"),
                    None => break "closed by server".to_string(),
                };
                match decode_frame(msg) {
                    Frame::Event(event) => {
                        if sink.send(ChannelEvent::Message(event)).await.is_err() {
                            crate::dlog!("[WS] Receiver gone, stopping");
                            return;
                        }
                    }
                    Frame::Skip => continue,
                    Frame::Close(reason) => break reason,
                }
            }
        }
    };

    tracing::warn!("[WS] Connection lost: {reason}");
    let _ = sink.send(ChannelEvent::Closed(reason)).await;
}
