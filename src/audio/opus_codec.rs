//! Opus encoder/decoder for the media relay's wire format.
//!
//! Both sides work on transport-shaped audio (mono or stereo at an Opus
//! rate); channel conversion and device rates are handled by capture and
//! playback.

use anyhow::Result;

fn opus_channels(channels: u16) -> opus::Channels {
    if channels == 1 {
        opus::Channels::Mono
    } else {
        opus::Channels::Stereo
    }
}

pub struct OpusEncoder {
    encoder: opus::Encoder,
    out_buf: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u16, bitrate: i32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus_channels(channels), opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;
        Ok(Self {
            encoder,
            out_buf: vec![0u8; 4000],
        })
    }

    /// Encode one frame; the length must be a valid Opus frame size
    /// (2.5 to 60 ms).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let len = self.encoder.encode(pcm, &mut self.out_buf)?;
        Ok(self.out_buf[..len].to_vec())
    }
}

pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: u16,
    pcm_buf: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels))?;
        // max 120ms @ 48kHz = 5760 samples/channel
        let pcm_buf = vec![0i16; 5760 * channels as usize];
        Ok(Self {
            decoder,
            channels,
            pcm_buf,
        })
    }

    /// Decode one packet into interleaved PCM.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let per_channel = self.decoder.decode(packet, &mut self.pcm_buf, false)?;
        Ok(self.pcm_buf[..per_channel * self.channels as usize].to_vec())
    }
}
