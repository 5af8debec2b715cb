//! Streaming mono resampler on top of rubato.
//!
//! rubato works on fixed-size chunks, so input is accumulated until a full
//! chunk is available and the remainder is kept for the next call.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler as _};

pub struct Resampler {
    inner: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        // 10ms chunks keep latency low for voice
        let chunk_size = (input_rate / 100).max(1) as usize;
        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            1,
            1,
        )
        .with_context(|| {
            format!("Failed to create resampler {}Hz -> {}Hz", input_rate, output_rate)
        })?;

        log::debug!(
            "Resampler {}Hz -> {}Hz, chunk={}",
            input_rate,
            output_rate,
            inner.input_frames_next()
        );

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            pending: Vec::new(),
        })
    }

    /// Resample one block of mono PCM. May return fewer samples than the
    /// rate ratio implies while input is still accumulating.
    pub fn process(&mut self, input: &[i16]) -> Result<Vec<i16>> {
        self.pending
            .extend(input.iter().map(|&s| f32::from(s) / 32768.0));

        let mut out = Vec::with_capacity(
            input.len() * self.output_rate as usize / self.input_rate as usize + 1,
        );
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk = [&self.pending[..needed]];
            let resampled = self
                .inner
                .process(&chunk, None)
                .context("Resample failed")?;
            self.pending.drain(..needed);
            out.extend(resampled[0].iter().map(|&s| to_i16(s)));
        }
        Ok(out)
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
