//! Local media handles and the source the controller acquires them from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::MediaError;
use crate::protocol::ParticipantId;

/// A captured local audio/video stream. Clones share the same mute flag.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    with_video: bool,
    audio_enabled: Arc<AtomicBool>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, with_video: bool) -> Self {
        Self {
            id: id.into(),
            with_video,
            audio_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_video(&self) -> bool {
        self.with_video
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }
}

/// Media received from one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer_id: ParticipantId,
    pub stream_id: String,
}

#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire camera and microphone. Permission prompts happen here.
    async fn acquire(&self) -> Result<LocalStream, MediaError>;
}

/// Fixed-outcome media source for headless runs and tests.
pub struct StubMediaSource {
    outcome: Mutex<Result<LocalStream, MediaError>>,
    requests: AtomicBool,
}

impl StubMediaSource {
    pub fn granted(stream: LocalStream) -> Self {
        Self {
            outcome: Mutex::new(Ok(stream)),
            requests: AtomicBool::new(false),
        }
    }

    pub fn failing(err: MediaError) -> Self {
        Self {
            outcome: Mutex::new(Err(err)),
            requests: AtomicBool::new(false),
        }
    }

    /// Whether anyone asked for media yet.
    pub fn was_requested(&self) -> bool {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl MediaSource for StubMediaSource {
    async fn acquire(&self) -> Result<LocalStream, MediaError> {
        self.requests.store(true, Ordering::Relaxed);
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
