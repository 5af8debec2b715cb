//! Opus encoder/decoder wrappers.
//!
//! - Encoder: buffers mono PCM at the working rate and emits one packet per
//!   full frame
//! - Decoder: one packet in, mono PCM at the decode rate out

use anyhow::{Context, Result};
use bytes::Bytes;

/// Upper bound for one encoded packet.
const MAX_OPUS_PACKET_SIZE: usize = 4000;

/// Largest frame Opus can produce: 120ms @ 48kHz.
const MAX_DECODE_FRAME_SAMPLES: usize = 5760;

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    duration_ms: u32,
    in_buffer: Vec<i16>,
}

impl OpusEncoder {
    /// Create a mono encoder.
    ///
    /// * `sample_rate` - Working sample rate (16000 for the capture path)
    /// * `duration_ms` - Frame duration in ms (e.g. 60)
    pub fn new(sample_rate: u32, duration_ms: u32) -> Result<Self> {
        let mut encoder =
            opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
                .context("Failed to create opus encoder")?;
        encoder
            .set_bitrate(opus::Bitrate::Auto)
            .context("Failed to set opus bitrate")?;

        Ok(Self {
            encoder,
            sample_rate,
            duration_ms,
            in_buffer: Vec::new(),
        })
    }

    /// Number of samples in one encoded frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.duration_ms / 1000) as usize
    }

    /// Append PCM and encode every complete frame, handing each packet to
    /// `handler`. Leftover samples stay buffered for the next call.
    pub fn encode<F>(&mut self, pcm: &[i16], mut handler: F) -> Result<()>
    where
        F: FnMut(Bytes),
    {
        self.in_buffer.extend_from_slice(pcm);

        let frame_size = self.frame_size();
        while self.in_buffer.len() >= frame_size {
            let packet = self
                .encoder
                .encode_vec(&self.in_buffer[..frame_size], MAX_OPUS_PACKET_SIZE);
            // 无论成功与否都要移除这一帧，避免坏数据卡住缓冲区
            self.in_buffer.drain(..frame_size);
            handler(Bytes::from(packet.context("Opus encode failed")?));
        }
        Ok(())
    }

    pub fn reset_state(&mut self) -> Result<()> {
        self.in_buffer.clear();
        self.encoder
            .reset_state()
            .context("Failed to reset opus encoder")
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: opus::Decoder,
    sample_rate: u32,
}

impl OpusDecoder {
    /// Create a mono decoder producing PCM at `sample_rate`.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, opus::Channels::Mono)
            .with_context(|| format!("Failed to create opus decoder @ {}Hz", sample_rate))?;
        Ok(Self {
            decoder,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode one packet to mono PCM.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; MAX_DECODE_FRAME_SAMPLES];
        let samples = self
            .decoder
            .decode(packet, &mut pcm, false)
            .context("Opus decode failed")?;
        pcm.truncate(samples);
        Ok(pcm)
    }

    pub fn reset_state(&mut self) -> Result<()> {
        self.decoder
            .reset_state()
            .context("Failed to reset opus decoder")
    }
}
