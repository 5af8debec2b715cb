//! ALSA-backed [`AudioDevice`].
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O:
//! - capture thread: readi one period at a time, cut into frames, signal
//!   input-ready
//! - playback thread: drain the output queue into writei, signal
//!   output-ready whenever the queue runs low

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::device::{AudioDevice, ReadyCallback};
use crate::util::lock;

/// Captured frames kept before the oldest is dropped.
const MAX_PENDING_INPUT: usize = 16;
/// Output-ready fires while fewer buffers than this are queued.
const OUTPUT_LOW_WATER: usize = 2;
const MAX_WRITE_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct AlsaConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    pub playback_device: String,
    pub input_sample_rate: u32,
    pub input_channels: u32,
    /// Second capture channel is the playback loopback
    pub input_reference: bool,
    pub output_sample_rate: u32,
    /// Mono output is duplicated across this many channels
    pub output_channels: u32,
    pub frame_duration_ms: u32,
}

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
struct AlsaParams {
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

#[derive(Default)]
struct Shared {
    input_frames: Mutex<VecDeque<Vec<i16>>>,
    output_frames: Mutex<VecDeque<Vec<i16>>>,
    output_available: Condvar,
    output_enabled: AtomicBool,
    input_ready: Mutex<Option<ReadyCallback>>,
    output_ready: Mutex<Option<ReadyCallback>>,
    running: AtomicBool,
}

pub struct AlsaAudioDevice {
    capture: Mutex<Option<(PCM, AlsaParams)>>,
    playback: Mutex<Option<(PCM, AlsaParams)>>,
    input_params: AlsaParams,
    output_params: AlsaParams,
    input_reference: bool,
    frame_duration_ms: u32,
    shared: Arc<Shared>,
}

impl AlsaAudioDevice {
    /// Open both PCM devices and negotiate their parameters. Threads start
    /// with [`AudioDevice::start`].
    pub fn open(config: &AlsaConfig) -> Result<Self> {
        let (capture, input_params) = open_pcm(
            &config.capture_device,
            Direction::Capture,
            config.input_sample_rate,
            config.input_channels,
        )?;
        let (playback, output_params) = open_pcm(
            &config.playback_device,
            Direction::Playback,
            config.output_sample_rate,
            config.output_channels,
        )?;

        let shared = Arc::new(Shared::default());
        shared.output_enabled.store(true, Ordering::Relaxed);

        Ok(Self {
            capture: Mutex::new(Some((capture, input_params.clone()))),
            playback: Mutex::new(Some((playback, output_params.clone()))),
            input_params,
            output_params,
            input_reference: config.input_reference && config.input_channels == 2,
            frame_duration_ms: config.frame_duration_ms,
            shared,
        })
    }
}

impl AudioDevice for AlsaAudioDevice {
    fn input_sample_rate(&self) -> u32 {
        self.input_params.sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_params.sample_rate
    }

    fn input_channels(&self) -> usize {
        self.input_params.channels as usize
    }

    fn input_reference(&self) -> bool {
        self.input_reference
    }

    fn input_data(&self) -> Option<Vec<i16>> {
        lock(&self.shared.input_frames).pop_front()
    }

    fn output_data(&self, pcm: &[i16]) {
        let channels = self.output_params.channels as usize;
        let frame = if channels > 1 {
            pcm.iter()
                .flat_map(|&s| std::iter::repeat_n(s, channels))
                .collect()
        } else {
            pcm.to_vec()
        };
        lock(&self.shared.output_frames).push_back(frame);
        self.shared.output_available.notify_one();
    }

    fn enable_output(&self, enable: bool) {
        if self.shared.output_enabled.swap(enable, Ordering::AcqRel) != enable {
            log::info!("Audio output {}", if enable { "enabled" } else { "disabled" });
        }
    }

    fn on_input_ready(&self, callback: ReadyCallback) {
        *lock(&self.shared.input_ready) = Some(callback);
    }

    fn on_output_ready(&self, callback: ReadyCallback) {
        *lock(&self.shared.output_ready) = Some(callback);
    }

    fn start(&self) -> Result<()> {
        let (capture, playback) = match (lock(&self.capture).take(), lock(&self.playback).take()) {
            (Some(capture), Some(playback)) => (capture, playback),
            _ => anyhow::bail!("Audio device already started"),
        };
        self.shared.running.store(true, Ordering::SeqCst);

        let frame_samples = (self.input_params.sample_rate * self.frame_duration_ms / 1000) as usize
            * self.input_params.channels as usize;
        {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(capture, frame_samples, &shared) {
                        log::error!("Recording thread error: {:#}", e);
                    }
                })
                .context("Failed to spawn audio-record thread")?;
        }
        {
            let shared = self.shared.clone();
            let poll = Duration::from_millis(self.frame_duration_ms as u64);
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(playback, poll, &shared) {
                        log::error!("Playback thread error: {:#}", e);
                    }
                })
                .context("Failed to spawn audio-play thread")?;
        }
        Ok(())
    }
}

impl Drop for AlsaAudioDevice {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.output_available.notify_all();
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

// ======================== Recording thread ========================

fn record_thread(
    (pcm, params): (PCM, AlsaParams),
    frame_samples: usize,
    shared: &Shared,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut accum_buf: Vec<i16> = Vec::with_capacity(frame_samples * 2);

    log::info!("Recording started: frame_samples={}", frame_samples);

    while shared.running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                accum_buf.extend_from_slice(&read_buf[..frames * channels]);
                while accum_buf.len() >= frame_samples {
                    let frame: Vec<i16> = accum_buf.drain(..frame_samples).collect();
                    {
                        let mut pending = lock(&shared.input_frames);
                        if pending.len() >= MAX_PENDING_INPUT {
                            pending.pop_front();
                        }
                        pending.push_back(frame);
                    }
                    if let Some(callback) = lock(&shared.input_ready).as_ref() {
                        callback();
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn play_thread((pcm, params): (PCM, AlsaParams), poll: Duration, shared: &Shared) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;

    log::info!("Playback started");

    while shared.running.load(Ordering::Relaxed) {
        let frame = {
            let mut queue = lock(&shared.output_frames);
            if queue.len() < OUTPUT_LOW_WATER {
                // 回调里只会置位事件，不会回头拿这把锁
                if let Some(callback) = lock(&shared.output_ready).as_ref() {
                    callback();
                }
            }
            if queue.is_empty() {
                queue = shared
                    .output_available
                    .wait_timeout(queue, poll)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
            queue.pop_front()
        };

        let Some(frame) = frame else {
            continue;
        };
        if !shared.output_enabled.load(Ordering::Acquire) {
            continue;
        }

        // Write with retry loop to handle short writes and XRUN recovery.
        let total_frames = frame.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            match io.writei(&frame[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    // 熔断器：底层持续跟不上写入速度时，丢弃剩余帧防止死循环
                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
