//! Mixed call recording.
//!
//! While a call is recorded, the capture thread and the playback thread both
//! append into one shared buffer. The two streams are delivered
//! independently, so insertion order is not chronological; chronology is
//! rebuilt from timestamps when the recording is mixed.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Microphone,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub source: FrameSource,
    pub samples: Vec<i16>,
    pub timestamp_us: u64,
}

/// Cheap, cloneable handle the audio threads append through.
#[derive(Debug, Clone, Default)]
pub struct RecordingTap {
    frames: Arc<Mutex<Vec<RecordedFrame>>>,
}

impl RecordingTap {
    pub fn push(&self, source: FrameSource, frame: &AudioFrame) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.push(RecordedFrame {
            source,
            samples: frame.samples.clone(),
            timestamp_us: frame.timestamp_us,
        });
    }

    fn drain(&self) -> Vec<RecordedFrame> {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *frames)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    /// Frames must share one length to be averaged sample-wise.
    FrameLength { expected: usize, found: usize },
    ZeroWindow,
}

impl fmt::Display for MixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MixError::FrameLength { expected, found } => {
                write!(f, "frame length mismatch: expected {}, found {}", expected, found)
            }
            MixError::ZeroWindow => write!(f, "mix window must be non-zero"),
        }
    }
}

impl std::error::Error for MixError {}

/// One call's recording, from the moment the call connects until teardown.
pub struct CallRecording {
    path: PathBuf,
    tap: RecordingTap,
    sample_rate: u32,
    window_ms: u64,
}

impl CallRecording {
    pub fn start(path: PathBuf, sample_rate: u32, window_ms: u64) -> Self {
        log::info!("Call recording started: {}", path.display());
        Self {
            path,
            tap: RecordingTap::default(),
            sample_rate,
            window_ms,
        }
    }

    pub fn tap(&self) -> RecordingTap {
        self.tap.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mix what was buffered and write it out. `Ok(None)` if nothing was
    /// captured.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        let frames = self.tap.drain();
        if frames.is_empty() {
            log::warn!("Call recording {} captured no audio", self.path.display());
            return Ok(None);
        }
        let count = frames.len();
        let mixed = mix(frames, self.window_ms * 1000);
        write_wav(&self.path, self.sample_rate, &mixed)?;
        log::info!(
            "Call recording saved: {} ({} frames, {} samples)",
            self.path.display(),
            count,
            mixed.len()
        );
        Ok(Some(self.path))
    }
}

/// Mix buffered frames into one mono track, degrading to microphone-only
/// audio if the frames cannot be mixed.
pub fn mix(frames: Vec<RecordedFrame>, window_us: u64) -> Vec<i16> {
    match mix_windows(&frames, window_us) {
        Ok(mixed) => mixed,
        Err(e) => {
            log::warn!("Recording mix failed ({}), keeping microphone audio only", e);
            concat(frames.iter().filter(|f| f.source == FrameSource::Microphone))
        }
    }
}

fn concat<'a>(frames: impl Iterator<Item = &'a RecordedFrame>) -> Vec<i16> {
    frames.flat_map(|f| f.samples.iter().copied()).collect()
}

/// Window-by-window mix of the buffered frames in timestamp order.
pub fn mix_windows(frames: &[RecordedFrame], window_us: u64) -> Result<Vec<i16>, MixError> {
    if window_us == 0 {
        return Err(MixError::ZeroWindow);
    }
    let mut ordered: Vec<&RecordedFrame> = frames.iter().collect();
    ordered.sort_by_key(|f| f.timestamp_us);

    let (Some(first), Some(last)) = (ordered.first(), ordered.last()) else {
        return Ok(Vec::new());
    };

    if !ordered.iter().any(|f| f.source == FrameSource::Remote) {
        return Ok(concat(ordered.into_iter()));
    }

    let frame_len = first.samples.len();
    if let Some(bad) = ordered.iter().find(|f| f.samples.len() != frame_len) {
        return Err(MixError::FrameLength {
            expected: frame_len,
            found: bad.samples.len(),
        });
    }

    let start = first.timestamp_us;
    let windows = ((last.timestamp_us - start) / window_us + 1) as usize;
    let mut out = Vec::with_capacity(windows * frame_len);
    let mut frames = ordered.into_iter().peekable();

    for w in 0..windows as u64 {
        let window_end = start + (w + 1) * window_us;
        let mut mic = WindowMean::new(frame_len);
        let mut remote = WindowMean::new(frame_len);
        while let Some(f) = frames.next_if(|f| f.timestamp_us < window_end) {
            match f.source {
                FrameSource::Microphone => mic.add(&f.samples),
                FrameSource::Remote => remote.add(&f.samples),
            }
        }
        let (mic, remote) = (mic.mean(), remote.mean());
        out.extend(mic.iter().zip(&remote).map(|(&m, &r)| {
            let mixed = (m as i32 + r as i32).div_euclid(2);
            mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16
        }));
    }
    Ok(out)
}

/// Sample-wise running sum of one source within one window.
struct WindowMean {
    sums: Vec<i64>,
    count: i64,
}

impl WindowMean {
    fn new(len: usize) -> Self {
        Self {
            sums: vec![0; len],
            count: 0,
        }
    }

    fn add(&mut self, samples: &[i16]) {
        for (sum, &s) in self.sums.iter_mut().zip(samples) {
            *sum += s as i64;
        }
        self.count += 1;
    }

    /// Integer mean truncated toward zero; silence when empty.
    fn mean(&self) -> Vec<i16> {
        if self.count == 0 {
            return vec![0; self.sums.len()];
        }
        self.sums.iter().map(|&s| (s / self.count) as i16).collect()
    }
}

fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}
