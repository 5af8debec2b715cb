//! Capture and playback paths between the audio device and the codec.
//!
//! Capture: device frame -> resample to 16kHz -> encoder -> packets.
//! Playback: packet -> decode queue -> decoder -> resample to device rate ->
//! device. Encode and decode run on the background executor; the queue
//! policy runs on the main loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;

use super::device::AudioDevice;
use super::opus_codec::{OpusDecoder, OpusEncoder};
use super::resampler::Resampler;
use crate::state_machine::DeviceState;
use crate::util::lock;

/// Rate everything on the capture side is converted to before encoding.
pub const WORKING_SAMPLE_RATE: u32 = 16000;

/// Idle time after which the output is switched off.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Decode queue, abort flag and last-output clock share one lock.
struct DecodeQueue {
    frames: VecDeque<Bytes>,
    aborted: bool,
    last_output: Instant,
}

struct OutputStage {
    decoder: OpusDecoder,
    resampler: Option<Resampler>,
}

struct InputStage {
    mic: Option<Resampler>,
    reference: Option<Resampler>,
}

pub struct AudioPipeline {
    device: Arc<dyn AudioDevice>,
    decode: Mutex<DecodeQueue>,
    output: Mutex<OutputStage>,
    encoder: Mutex<OpusEncoder>,
    input: Mutex<InputStage>,
    silence_timeout: Duration,
}

impl AudioPipeline {
    pub fn new(device: Arc<dyn AudioDevice>, frame_duration_ms: u32) -> Result<Self> {
        let input_rate = device.input_sample_rate();
        let input = if input_rate == WORKING_SAMPLE_RATE {
            InputStage {
                mic: None,
                reference: None,
            }
        } else {
            InputStage {
                mic: Some(Resampler::new(input_rate, WORKING_SAMPLE_RATE)?),
                reference: if device.input_channels() == 2 {
                    Some(Resampler::new(input_rate, WORKING_SAMPLE_RATE)?)
                } else {
                    None
                },
            }
        };

        let output = Self::output_stage(WORKING_SAMPLE_RATE, device.output_sample_rate())?;
        let encoder = OpusEncoder::new(WORKING_SAMPLE_RATE, frame_duration_ms)?;

        log::info!(
            "Audio pipeline: input {}Hz x{}, output {}Hz, frame {}ms",
            input_rate,
            device.input_channels(),
            device.output_sample_rate(),
            frame_duration_ms
        );

        Ok(Self {
            device,
            decode: Mutex::new(DecodeQueue {
                frames: VecDeque::new(),
                aborted: false,
                last_output: Instant::now(),
            }),
            output: Mutex::new(output),
            encoder: Mutex::new(encoder),
            input: Mutex::new(input),
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = timeout;
        self
    }

    fn output_stage(decode_rate: u32, device_rate: u32) -> Result<OutputStage> {
        let resampler = if decode_rate == device_rate {
            None
        } else {
            Some(Resampler::new(decode_rate, device_rate)?)
        };
        Ok(OutputStage {
            decoder: OpusDecoder::new(decode_rate)?,
            resampler,
        })
    }

    // ======================== Capture ========================

    /// Read one frame from the device and convert it to the working rate.
    /// Dual-channel frames stay interleaved (mic, reference).
    pub fn read_input(&self) -> Result<Option<Vec<i16>>> {
        let Some(data) = self.device.input_data() else {
            return Ok(None);
        };

        let mut input = lock(&self.input);
        let InputStage { mic, reference } = &mut *input;
        let data = match (mic, reference) {
            (None, _) => data,
            (Some(mic), None) => mic.process(&data)?,
            (Some(mic), Some(reference)) => {
                let (mic_pcm, reference_pcm) = deinterleave(&data);
                interleave(&mic.process(&mic_pcm)?, &reference.process(&reference_pcm)?)
            }
        };
        Ok(Some(data))
    }

    /// Encode mono 16kHz PCM, handing every complete packet to `handler`.
    pub fn encode<F>(&self, pcm: &[i16], handler: F)
    where
        F: FnMut(Bytes),
    {
        if let Err(e) = lock(&self.encoder).encode(pcm, handler) {
            log::warn!("{:#}", e);
        }
    }

    pub fn reset_encoder(&self) {
        if let Err(e) = lock(&self.encoder).reset_state() {
            log::warn!("{:#}", e);
        }
    }

    // ======================== Playback ========================

    /// Queue a frame from the server. Only accepted while speaking.
    pub fn enqueue_incoming(&self, frame: Bytes, state: DeviceState) -> bool {
        let mut decode = lock(&self.decode);
        if state == DeviceState::Speaking {
            decode.frames.push_back(frame);
            true
        } else {
            false
        }
    }

    /// Queue locally generated frames (alert cues) regardless of state.
    pub fn enqueue_local(&self, frames: impl IntoIterator<Item = Bytes>) {
        lock(&self.decode).frames.extend(frames);
    }

    /// Pick the next frame to decode when the device wants more output.
    pub fn next_output_frame(&self, state: DeviceState) -> Option<Bytes> {
        let mut decode = lock(&self.decode);
        if decode.frames.is_empty() {
            if state == DeviceState::Idle && decode.last_output.elapsed() > self.silence_timeout {
                self.device.enable_output(false);
            }
            return None;
        }

        if state == DeviceState::Listening {
            decode.frames.clear();
            return None;
        }

        let frame = decode.frames.pop_front();
        decode.last_output = Instant::now();
        frame
    }

    /// Decode one frame and write it to the device. Runs on the background
    /// executor. Dropped without decoding while the abort flag is set.
    pub fn decode_and_play(&self, frame: &[u8]) {
        if lock(&self.decode).aborted {
            return;
        }

        let pcm = {
            let mut output = lock(&self.output);
            let pcm = match output.decoder.decode(frame) {
                Ok(pcm) => pcm,
                Err(e) => {
                    log::warn!("Dropping frame: {:#}", e);
                    return;
                }
            };
            match output.resampler.as_mut() {
                Some(resampler) => match resampler.process(&pcm) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        log::warn!("Dropping frame: {:#}", e);
                        return;
                    }
                },
                None => pcm,
            }
        };

        if !pcm.is_empty() {
            self.device.output_data(&pcm);
        }
    }

    pub fn set_aborted(&self, aborted: bool) {
        lock(&self.decode).aborted = aborted;
    }

    /// Reset the decoder, drop queued frames, clear the abort flag, restart
    /// the silence clock and switch the output back on. Frames queued after
    /// this call play even if the previous reply was aborted.
    pub fn reset_decoder(&self) {
        if let Err(e) = lock(&self.output).decoder.reset_state() {
            log::warn!("{:#}", e);
        }
        {
            let mut decode = lock(&self.decode);
            decode.frames.clear();
            decode.aborted = false;
            decode.last_output = Instant::now();
        }
        self.device.enable_output(true);
    }

    pub fn decode_sample_rate(&self) -> u32 {
        lock(&self.output).decoder.sample_rate()
    }

    /// Replace the decoder (and output resampler) for a new stream rate.
    /// Callers must hold the background barrier so no decode job is in
    /// flight.
    pub fn set_decode_sample_rate(&self, sample_rate: u32) -> Result<()> {
        if self.decode_sample_rate() == sample_rate {
            return Ok(());
        }
        let stage = Self::output_stage(sample_rate, self.device.output_sample_rate())?;
        *lock(&self.output) = stage;
        log::info!("Decode sample rate -> {}Hz", sample_rate);
        Ok(())
    }

    pub fn enable_output(&self, enable: bool) {
        self.device.enable_output(enable);
    }
}

fn deinterleave(data: &[i16]) -> (Vec<i16>, Vec<i16>) {
    data.chunks_exact(2).map(|pair| (pair[0], pair[1])).unzip()
}

fn interleave(mic: &[i16], reference: &[i16]) -> Vec<i16> {
    mic.iter()
        .zip(reference)
        .flat_map(|(&m, &r)| [m, r])
        .collect()
}

/// First channel of an interleaved frame.
pub fn mic_channel(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.iter().step_by(channels).copied().collect()
}
