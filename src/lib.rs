/// Debug-level trace line. Tagged like `[Room]`, `[Peer]` so the output can
/// be grepped per subsystem.
#[macro_export]
macro_rules! dlog {
    ($($arg:tt)*) => {
        ::tracing::debug!($($arg)*)
    };
}

pub mod channel;
pub mod controller;
pub mod directory;
pub mod error;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod settings;

#[cfg(test)]
mod testing;

pub use channel::{ChannelEvent, RoomChannel, WsRoomChannel};
pub use controller::{Collaborators, Lifecycle, RoomController};
pub use error::{CloseReason, MediaError, RoomError};
pub use room::{Focus, Intent, Playback, RoomSnapshot, RoomState, SelfIdentity};
pub use settings::Settings;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Calling it twice is harmless.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        tracing::debug!("logging already initialised: {err}");
    }
}
