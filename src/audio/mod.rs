//! audio - microphone capture, speaker playback and the Opus codec
//!
//! Capture and playback run in dedicated OS threads so per-frame work never
//! waits on the async session loop. Frames cross into the network side
//! through bounded channels with explicit drop policies.

mod alsa_device;
mod audio_system;
mod capture;
pub mod frame;
mod opus_codec;
mod playback;

pub use audio_system::{AlsaAudio, AudioConfig};
pub use frame::AudioFrame;
pub use opus_codec::{OpusDecoder, OpusEncoder};

use tokio::sync::{broadcast, mpsc};

use crate::media::RemoteFrame;
use crate::recording::RecordingTap;

/// Both directions of one connected call, handed to the audio device.
pub struct AudioLinks {
    /// Capture → publish. Written with `try_send`: a full or closed channel
    /// drops that frame.
    pub uplink: mpsc::Sender<AudioFrame>,
    /// Subscribed remote audio → speaker. A lagging reader skips the oldest
    /// frames.
    pub downlink: broadcast::Receiver<RemoteFrame>,
    pub recording: Option<RecordingTap>,
}

/// Exclusive owner of the microphone and speaker.
pub trait AudioDevice: Send {
    fn start(&mut self, links: AudioLinks) -> anyhow::Result<()>;
    fn stop(&mut self);
}
