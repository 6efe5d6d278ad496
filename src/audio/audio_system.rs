//! ALSA-backed audio device: one capture thread and one playback thread per
//! connected call.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use super::capture::capture_thread;
use super::playback::playback_thread;
use super::{AudioDevice, AudioLinks};
use crate::config::Config;

/// How long `start` waits for a thread to open its PCM.
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Each audio thread sends exactly one report once its device is open (or
/// failed to open).
pub type OpenReport = SyncSender<Result<()>>;

fn wait_opened(opened: &Receiver<Result<()>>, role: &str) -> Result<()> {
    match opened.recv_timeout(OPEN_TIMEOUT) {
        Ok(result) => result.with_context(|| format!("{} device failed to open", role)),
        Err(RecvTimeoutError::Timeout) => {
            anyhow::bail!("{} device did not open within {:?}", role, OPEN_TIMEOUT)
        }
        Err(RecvTimeoutError::Disconnected) => {
            anyhow::bail!("{} thread exited before opening its device", role)
        }
    }
}

/// Audio device configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Rate shared by the devices and the transport frames
    pub sample_rate: u32,
    pub capture_channels: u32,
    pub playback_channels: u32,
    /// Transport frame duration in ms (e.g. 20)
    pub frame_duration_ms: u32,
    /// Linear gain applied to the microphone before publishing
    pub capture_gain: f32,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
}

impl From<&Config> for AudioConfig {
    fn from(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            sample_rate: config.sample_rate,
            capture_channels: config.capture_channels,
            playback_channels: config.playback_channels,
            frame_duration_ms: config.frame_duration_ms,
            capture_gain: config.capture_gain,
            playback_period_size: config.playback_period_size,
        }
    }
}

/// Microphone and speaker, owned by whichever call is connected.
///
/// - Capture thread: ALSA capture → downmix → gain → `links.uplink`
/// - Playback thread: `links.downlink` → upmix → ALSA playback
pub struct AlsaAudio {
    config: AudioConfig,
    running: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    playback_handle: Option<JoinHandle<()>>,
}

impl AlsaAudio {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            capture_handle: None,
            playback_handle: None,
        }
    }
}

impl AudioDevice for AlsaAudio {
    fn start(&mut self, links: AudioLinks) -> Result<()> {
        if self.capture_handle.is_some() || self.playback_handle.is_some() {
            anyhow::bail!("audio device already in use");
        }
        // 每次通话使用新的运行标志，旧线程不会被重新唤醒
        let running = Arc::new(AtomicBool::new(true));
        self.running = running.clone();

        log::info!(
            "Audio starting: capture \"{}\", playback \"{}\", rate {}Hz, frame {}ms",
            self.config.capture_device,
            self.config.playback_device,
            self.config.sample_rate,
            self.config.frame_duration_ms,
        );

        let AudioLinks {
            uplink,
            downlink,
            recording,
        } = links;

        let (capture_opened, capture_report) = std_mpsc::sync_channel(1);
        let (playback_opened, playback_report) = std_mpsc::sync_channel(1);

        let capture_handle = {
            let running = running.clone();
            let config = self.config.clone();
            let recording = recording.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    if let Err(e) = capture_thread(&config, uplink, recording, &running, capture_opened) {
                        log::error!("Capture thread error: {}", e);
                    }
                })?
        };
        self.capture_handle = Some(capture_handle);

        let playback_handle = {
            let config = self.config.clone();
            let spawned = thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    if let Err(e) = playback_thread(&config, downlink, recording, &running, playback_opened) {
                        log::error!("Playback thread error: {}", e);
                    }
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            }
        };
        self.playback_handle = Some(playback_handle);

        // 两个设备都打开成功才算启动
        let opened = wait_opened(&capture_report, "capture")
            .and_then(|()| wait_opened(&playback_report, "playback"));
        if let Err(e) = opened {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Signal both threads to stop and wait for them to finish.
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let mut stopped = false;
        if let Some(h) = self.capture_handle.take() {
            let _ = h.join();
            stopped = true;
        }
        if let Some(h) = self.playback_handle.take() {
            let _ = h.join();
            stopped = true;
        }
        if stopped {
            log::info!("Audio stopped");
        }
    }
}

impl Drop for AlsaAudio {
    fn drop(&mut self) {
        self.stop();
    }
}
