use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use karaoke_room::channel::{RoomChannel, WsRoomChannel};
use karaoke_room::directory::{SocketOnly, StaticDirectory};
use karaoke_room::media::StubMediaSource;
use karaoke_room::peer::SignalingOnly;
use karaoke_room::{init_logging, Collaborators, MediaError, RoomController, Settings};
use tracing::info;

const USAGE: &str = "usage: karaoke-room <settings.json> <room-id> <host-id>";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(std::env::var("LOG_JSON").is_ok_and(|v| v == "1"));

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(room_id), Some(host_id)) = (args.next(), args.next(), args.next())
    else {
        bail!(USAGE);
    };

    let settings = Settings::load(&PathBuf::from(path))?;
    if settings.ws_url.is_empty() {
        bail!("ws_url is not set in settings");
    }

    let channel_settings = settings.clone();
    let deps = Collaborators {
        directory: Arc::new(StaticDirectory::new().with_room(room_id.clone(), host_id)),
        api: Arc::new(SocketOnly),
        media: Arc::new(StubMediaSource::failing(MediaError::DeviceUnavailable)),
        connector: Arc::new(SignalingOnly),
        channels: Box::new(move || {
            Box::new(WsRoomChannel::from_settings(&channel_settings)) as Box<dyn RoomChannel>
        }),
    };
    let controller =
        RoomController::new(settings.identity(), deps).with_event_buffer(settings.event_buffer);

    let snapshot = controller
        .join_room(&room_id)
        .await
        .with_context(|| format!("Failed to join room {room_id}"))?;
    info!("Joined {} as {:?}", snapshot.room_id, snapshot.self_role);

    let mut updates = controller
        .subscribe()
        .await
        .context("Room closed before it could be observed")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving room");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!("{json}"),
                    Err(err) => tracing::warn!("Could not encode snapshot: {err}"),
                }
                if let Some(reason) = &snapshot.closed {
                    info!("Room closed: {reason}");
                    break;
                }
            }
        }
    }

    if let Err(err) = controller.leave_room().await {
        tracing::debug!("leave_room: {err}");
    }
    Ok(())
}
