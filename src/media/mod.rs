//! media - the call room: publishing local audio, subscribing to remote
//! audio, and participant presence.

mod relay;

pub use relay::RelayMediaClient;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::audio::AudioFrame;

/// One decoded frame from a remote participant.
#[derive(Debug, Clone)]
pub struct RemoteFrame {
    pub participant: String,
    pub frame: AudioFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Connected,
    /// The room transport went away without `leave()` being called.
    Disconnected,
    ParticipantJoined(String),
    ParticipantLeft(String),
}

/// Real-time room transport. Events are delivered through the session
/// event channel the implementation was built with.
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// Connect to `room_name`. Failures are logged and reported as `false`.
    async fn join(&self, room_name: &str, token: &str) -> bool;

    /// Disconnect from the current room, if any. Never fails.
    async fn leave(&self);

    /// Start publishing the local track from `frames`.
    fn publish(&self, frames: mpsc::Receiver<AudioFrame>) -> anyhow::Result<()>;

    /// Remote audio from every participant, decoded to PCM.
    fn subscribe(&self) -> anyhow::Result<broadcast::Receiver<RemoteFrame>>;
}
