use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use anyhow::Result;

use super::alsa_device::AlsaStream;
use super::audio_system::{AudioConfig, OpenReport};
use super::frame::{self, AudioFrame};
use crate::recording::{FrameSource, RecordingTap};

/// Turns raw device periods into attenuated, transport-shaped frames.
///
/// Kept separate from the ALSA loop so the shaping can be exercised without
/// a sound card.
pub struct FrameShaper {
    device_channels: usize,
    sample_rate: u32,
    frame_len: usize,
    gain: f32,
    accum: Vec<i16>,
}

impl FrameShaper {
    pub fn new(device_channels: u32, sample_rate: u32, frame_duration_ms: u32, gain: f32) -> Result<Self> {
        let frame_len = frame::frame_len(sample_rate, frame_duration_ms);
        if frame_len == 0 {
            anyhow::bail!(
                "{}ms at {}Hz is shorter than one sample",
                frame_duration_ms,
                sample_rate
            );
        }
        Ok(Self {
            device_channels: device_channels as usize,
            sample_rate,
            frame_len,
            gain,
            accum: Vec::with_capacity(frame_len * 2),
        })
    }

    /// Feed one interleaved period, get back every completed mono frame.
    pub fn push(&mut self, interleaved: &[i16], now_us: u64) -> Vec<AudioFrame> {
        frame::downmix_into(interleaved, self.device_channels, &mut self.accum);

        let mut out = Vec::new();
        while self.accum.len() >= self.frame_len {
            let mut samples: Vec<i16> = self.accum.drain(..self.frame_len).collect();
            frame::attenuate(&mut samples, self.gain);
            out.push(AudioFrame::new(samples, self.sample_rate, 1, now_us));
        }
        out
    }
}

/// Outcome of handing a frame to the network side.
#[derive(Debug, PartialEq, Eq)]
pub enum Handoff {
    Sent,
    Dropped,
    Closed,
}

pub fn hand_off(uplink: &mpsc::Sender<AudioFrame>, frame: AudioFrame) -> Handoff {
    match uplink.try_send(frame) {
        Ok(()) => Handoff::Sent,
        Err(TrySendError::Full(_)) => Handoff::Dropped,
        Err(TrySendError::Closed(_)) => Handoff::Closed,
    }
}

pub fn capture_thread(
    config: &AudioConfig,
    uplink: mpsc::Sender<AudioFrame>,
    recording: Option<RecordingTap>,
    running: &AtomicBool,
    opened: OpenReport,
) -> Result<()> {
    let setup = AlsaStream::capture(&config.capture_device, config.sample_rate, config.capture_channels)
        .and_then(|stream| {
            let shaper = FrameShaper::new(
                stream.channels,
                stream.sample_rate,
                config.frame_duration_ms,
                config.capture_gain,
            )?;
            Ok((stream, shaper))
        });
    let (stream, mut shaper) = match setup {
        Ok(setup) => {
            let _ = opened.send(Ok(()));
            setup
        }
        Err(e) => {
            // start() reports the failure
            let _ = opened.send(Err(e));
            return Ok(());
        }
    };
    // ALSA read buffer (interleaved i16, one period)
    let mut read_buf = vec![0i16; stream.period_size * stream.channels as usize];
    let io = stream.pcm.io_i16()?;
    let mut dropped: u64 = 0;

    log::info!(
        "Capture started: rate={}, ch={}, period={}, gain={}",
        stream.sample_rate,
        stream.channels,
        stream.period_size,
        config.capture_gain,
    );

    while running.load(Ordering::Relaxed) {
        let frames = match io.readi(&mut read_buf) {
            Ok(frames) => frames,
            Err(e) => {
                if !stream.recover(&e) {
                    break;
                }
                continue;
            }
        };

        let now = frame::monotonic_us();
        for audio in shaper.push(&read_buf[..frames * stream.channels as usize], now) {
            if let Some(tap) = &recording {
                tap.push(FrameSource::Microphone, &audio);
            }
            match hand_off(&uplink, audio) {
                Handoff::Sent => {}
                Handoff::Dropped => {
                    dropped += 1;
                    if dropped % 50 == 1 {
                        log::debug!("Uplink full, {} capture frames dropped so far", dropped);
                    }
                }
                Handoff::Closed => {
                    log::info!("Uplink closed, stopping capture");
                    return Ok(());
                }
            }
        }
    }

    log::info!("Capture stopped ({} frames dropped)", dropped);
    Ok(())
}
