//! PCM frame type shared by capture, playback, the media client and the
//! call recorder.

use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Capture (or arrival) time on the process-wide monotonic clock.
    pub timestamp_us: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16, timestamp_us: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            timestamp_us,
        }
    }
}

/// Microseconds since the first call in this process. Microphone and remote
/// frames are stamped from the same clock so recordings can be re-ordered.
pub fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Samples per channel in one frame of `duration_ms` at `sample_rate`.
pub fn frame_len(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as u64 * duration_ms as u64 / 1000) as usize
}

/// Linear gain applied in place, saturating at the i16 range.
pub fn attenuate(samples: &mut [i16], gain: f32) {
    for s in samples.iter_mut() {
        let scaled = (*s as f32 * gain).round();
        *s = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

/// Average interleaved channels down to mono, appending to `out`.
pub fn downmix_into(interleaved: &[i16], channels: usize, out: &mut Vec<i16>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    for frame in interleaved.chunks_exact(channels) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        out.push((sum / channels as i32) as i16);
    }
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn upmix(mono: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels);
    for &s in mono {
        out.extend(std::iter::repeat_n(s, channels));
    }
    out
}
