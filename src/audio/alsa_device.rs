//! ALSA PCM handles for the microphone and speaker.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// An opened, configured PCM plus what the hardware actually agreed to.
pub struct AlsaStream {
    pub pcm: PCM,
    pub sample_rate: u32,
    pub channels: u32,
    pub period_size: usize,
}

impl AlsaStream {
    pub fn capture(device: &str, sample_rate: u32, channels: u32) -> Result<Self> {
        Self::open(device, Direction::Capture, sample_rate, channels, None)
    }

    pub fn playback(
        device: &str,
        sample_rate: u32,
        channels: u32,
        period_size: Option<usize>,
    ) -> Result<Self> {
        Self::open(device, Direction::Playback, sample_rate, channels, period_size)
    }

    fn open(
        device: &str,
        direction: Direction,
        sample_rate: u32,
        channels: u32,
        period_size: Option<usize>,
    ) -> Result<Self> {
        let dir_name = match direction {
            Direction::Capture => "capture",
            Direction::Playback => "playback",
        };
        let pcm = PCM::new(device, direction, false)
            .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

        {
            let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::S16LE)?;
            hwp.set_channels(channels)?;
            hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
            if let Some(ps) = period_size {
                hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            }
            pcm.hw_params(&hwp)
                .with_context(|| format!("Device '{}' rejected {} parameters", device, dir_name))?;
        }

        let (rate, ch, ps) = {
            let hwp = pcm.hw_params_current()?;
            (hwp.get_rate()?, hwp.get_channels()?, hwp.get_period_size()? as usize)
        };

        check_rate(dir_name, device, sample_rate, rate)?;
        log::info!(
            "ALSA {}: device={}, rate={}, channels={}, period_size={}",
            dir_name,
            device,
            rate,
            ch,
            ps,
        );

        Ok(Self {
            pcm,
            sample_rate: rate,
            channels: ch,
            period_size: ps,
        })
    }

    /// Recover from an XRUN or suspend. Returns false if the device is gone.
    pub fn recover(&self, err: &alsa::Error) -> bool {
        log::warn!("ALSA error: {}, recovering...", err);
        match self.pcm.prepare() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to recover PCM: {}", e);
                false
            }
        }
    }
}

/// Encoder, decoders and the recording header all run at the requested rate.
fn check_rate(dir_name: &str, device: &str, requested: u32, negotiated: u32) -> Result<()> {
    if negotiated != requested {
        anyhow::bail!(
            "ALSA {} on {} negotiated {}Hz instead of {}Hz (use a plug device to resample)",
            dir_name,
            device,
            negotiated,
            requested
        );
    }
    Ok(())
}
