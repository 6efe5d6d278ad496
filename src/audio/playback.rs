use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use anyhow::Result;

use super::alsa_device::AlsaStream;
use super::audio_system::{AudioConfig, OpenReport};
use super::frame;
use crate::media::RemoteFrame;
use crate::recording::{FrameSource, RecordingTap};

const IDLE_POLL: Duration = Duration::from_millis(5);

/// What the playback loop should do next.
#[derive(Debug)]
pub enum Pull {
    Frame(RemoteFrame),
    /// Nothing queued right now.
    Empty,
    /// The speaker fell behind and the oldest `n` frames were skipped.
    Skipped(u64),
    Closed,
}

pub fn pull(downlink: &mut broadcast::Receiver<RemoteFrame>) -> Pull {
    match downlink.try_recv() {
        Ok(frame) => Pull::Frame(frame),
        Err(TryRecvError::Empty) => Pull::Empty,
        Err(TryRecvError::Lagged(n)) => Pull::Skipped(n),
        Err(TryRecvError::Closed) => Pull::Closed,
    }
}

pub fn playback_thread(
    config: &AudioConfig,
    mut downlink: broadcast::Receiver<RemoteFrame>,
    recording: Option<RecordingTap>,
    running: &AtomicBool,
    opened: OpenReport,
) -> Result<()> {
    let period_size_opt = (config.playback_period_size > 0).then_some(config.playback_period_size);
    let stream = match AlsaStream::playback(
        &config.playback_device,
        config.sample_rate,
        config.playback_channels,
        period_size_opt,
    ) {
        Ok(stream) => {
            let _ = opened.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = opened.send(Err(e));
            return Ok(());
        }
    };
    let channels = stream.channels as usize;
    let io = stream.pcm.io_i16()?;
    let mut skipped: u64 = 0;

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        stream.sample_rate,
        stream.channels,
        stream.period_size,
    );

    while running.load(Ordering::Relaxed) {
        let remote = match pull(&mut downlink) {
            Pull::Frame(remote) => remote,
            Pull::Empty => {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            Pull::Skipped(n) => {
                skipped += n;
                log::debug!("Playback behind, skipped {} frames ({} total)", n, skipped);
                continue;
            }
            Pull::Closed => {
                log::info!("Downlink closed");
                break;
            }
        };

        if let Some(tap) = &recording {
            tap.push(FrameSource::Remote, &remote.frame);
        }

        let pcm = if remote.frame.channels == 1 {
            frame::upmix(&remote.frame.samples, channels)
        } else {
            remote.frame.samples
        };

        // Short writes and XRUNs are retried; a device that keeps failing
        // loses the rest of this frame.
        let total_frames = pcm.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    retry_count += 1;
                    if !stream.recover(&e) {
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries reached, dropping {} unwritten frames",
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped ({} frames skipped)", skipped);
    Ok(())
}
