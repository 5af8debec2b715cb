//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;

use crate::audio::{
    AudioDevice, AudioProcessor, OpusEncoder, PcmCallback, ReadyCallback, VadCallback,
    WakeWordCallback, WakeWordDetector,
};
use crate::board::{Board, Display, Led};
use crate::iot::ThingManager;
use crate::protocol::{DEFAULT_SERVER_SAMPLE_RATE, Protocol, ProtocolCallbacks};
use crate::state_machine::DeviceState;

pub fn sine_wave(freq: f32, sample_rate: u32, samples: usize) -> Vec<i16> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            ((2.0 * std::f32::consts::PI * freq * t).sin() * 8000.0) as i16
        })
        .collect()
}

/// `count` real 60ms Opus frames at 16kHz.
pub fn encode_frames(count: usize) -> Vec<Bytes> {
    let mut encoder = OpusEncoder::new(16000, 60).unwrap();
    let mut frames = Vec::new();
    encoder
        .encode(&sine_wave(440.0, 16000, 960 * count), |f| frames.push(f))
        .unwrap();
    frames
}

// ======================== Audio device ========================

pub struct FakeAudioDevice {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    inputs: Mutex<VecDeque<Vec<i16>>>,
    played: Mutex<Vec<Vec<i16>>>,
    output_enabled: Mutex<Vec<bool>>,
    input_ready: Mutex<Option<ReadyCallback>>,
    output_ready: Mutex<Option<ReadyCallback>>,
    started: AtomicBool,
}

impl FakeAudioDevice {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Self {
        Self {
            input_rate,
            output_rate,
            channels,
            inputs: Mutex::new(VecDeque::new()),
            played: Mutex::new(Vec::new()),
            output_enabled: Mutex::new(Vec::new()),
            input_ready: Mutex::new(None),
            output_ready: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn push_input(&self, frame: Vec<i16>) {
        self.inputs.lock().unwrap().push_back(frame);
    }

    pub fn pending_inputs(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub fn played(&self) -> Vec<Vec<i16>> {
        self.played.lock().unwrap().clone()
    }

    pub fn output_enabled_history(&self) -> Vec<bool> {
        self.output_enabled.lock().unwrap().clone()
    }

    pub fn fire_input_ready(&self) {
        if let Some(callback) = self.input_ready.lock().unwrap().as_ref() {
            callback();
        }
    }

    pub fn fire_output_ready(&self) {
        if let Some(callback) = self.output_ready.lock().unwrap().as_ref() {
            callback();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl AudioDevice for FakeAudioDevice {
    fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn input_channels(&self) -> usize {
        self.channels
    }

    fn input_reference(&self) -> bool {
        self.channels == 2
    }

    fn input_data(&self) -> Option<Vec<i16>> {
        self.inputs.lock().unwrap().pop_front()
    }

    fn output_data(&self, pcm: &[i16]) {
        self.played.lock().unwrap().push(pcm.to_vec());
    }

    fn enable_output(&self, enable: bool) {
        self.output_enabled.lock().unwrap().push(enable);
    }

    fn on_input_ready(&self, callback: ReadyCallback) {
        *self.input_ready.lock().unwrap() = Some(callback);
    }

    fn on_output_ready(&self, callback: ReadyCallback) {
        *self.output_ready.lock().unwrap() = Some(callback);
    }

    fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ======================== Display / LED ========================

#[derive(Default)]
pub struct FakeDisplay {
    pub statuses: Mutex<Vec<String>>,
    pub emotions: Mutex<Vec<String>>,
    pub chat: Mutex<Vec<(String, String)>>,
    pub notifications: Mutex<Vec<String>>,
    pub icons: Mutex<Vec<String>>,
}

impl FakeDisplay {
    pub fn last_status(&self) -> Option<String> {
        self.statuses.lock().unwrap().last().cloned()
    }
}

impl Display for FakeDisplay {
    fn set_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }

    fn set_emotion(&self, emotion: &str) {
        self.emotions.lock().unwrap().push(emotion.to_string());
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.chat
            .lock()
            .unwrap()
            .push((role.to_string(), content.to_string()));
    }

    fn show_notification(&self, message: &str) {
        self.notifications.lock().unwrap().push(message.to_string());
    }

    fn set_icon(&self, icon: &str) {
        self.icons.lock().unwrap().push(icon.to_string());
    }
}

#[derive(Default)]
pub struct FakeLed {
    pub changes: Mutex<Vec<(DeviceState, bool)>>,
}

impl Led for FakeLed {
    fn on_state_changed(&self, state: DeviceState, voice_detected: bool) {
        self.changes.lock().unwrap().push((state, voice_detected));
    }
}

// ======================== Things ========================

pub struct FakeThings {
    pub descriptors: String,
    pub states: Mutex<String>,
    pub invoked: Mutex<Vec<Value>>,
}

impl Default for FakeThings {
    fn default() -> Self {
        Self {
            descriptors: r#"[{"name":"Lamp"}]"#.to_string(),
            states: Mutex::new(r#"[{"name":"Lamp","state":{"power":false}}]"#.to_string()),
            invoked: Mutex::new(Vec::new()),
        }
    }
}

impl ThingManager for FakeThings {
    fn descriptors_json(&self) -> String {
        self.descriptors.clone()
    }

    fn states_json(&self) -> String {
        self.states.lock().unwrap().clone()
    }

    fn invoke(&self, command: &Value) {
        self.invoked.lock().unwrap().push(command.clone());
    }
}

pub struct FakeBoard {
    pub audio: Arc<FakeAudioDevice>,
    pub display: Arc<FakeDisplay>,
    pub led: Arc<FakeLed>,
    pub things: Arc<FakeThings>,
}

impl FakeBoard {
    pub fn new(audio: FakeAudioDevice) -> Self {
        Self {
            audio: Arc::new(audio),
            display: Arc::default(),
            led: Arc::default(),
            things: Arc::default(),
        }
    }

    pub fn board(&self) -> Board {
        Board {
            audio: self.audio.clone(),
            display: self.display.clone(),
            led: self.led.clone(),
            things: self.things.clone(),
        }
    }
}

// ======================== Protocol ========================

/// Records everything sent; opening succeeds unless told otherwise.
pub struct FakeProtocol {
    callbacks: ProtocolCallbacks,
    session_id: Mutex<String>,
    server_sample_rate: AtomicU32,
    open_succeeds: AtomicBool,
    opened: AtomicBool,
    open_calls: AtomicUsize,
    sent_text: Mutex<Vec<String>>,
    sent_audio: Mutex<Vec<Bytes>>,
}

impl FakeProtocol {
    pub fn new() -> Self {
        Self {
            callbacks: ProtocolCallbacks::default(),
            session_id: Mutex::new(String::new()),
            server_sample_rate: AtomicU32::new(DEFAULT_SERVER_SAMPLE_RATE),
            open_succeeds: AtomicBool::new(true),
            opened: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            sent_text: Mutex::new(Vec::new()),
            sent_audio: Mutex::new(Vec::new()),
        }
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.lock().unwrap() = session_id.to_string();
    }

    pub fn set_server_sample_rate(&self, sample_rate: u32) {
        self.server_sample_rate.store(sample_rate, Ordering::SeqCst);
    }

    pub fn set_open_succeeds(&self, succeeds: bool) {
        self.open_succeeds.store(succeeds, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_text
            .lock()
            .unwrap()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    /// Sent messages whose `type` matches.
    pub fn sent_of_type(&self, msg_type: &str) -> Vec<Value> {
        self.sent_json()
            .into_iter()
            .filter(|m| m["type"] == msg_type)
            .collect()
    }

    pub fn sent_audio(&self) -> Vec<Bytes> {
        self.sent_audio.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent_text.lock().unwrap().clear();
        self.sent_audio.lock().unwrap().clear();
    }

    /// Deliver a server message as the transport would.
    pub fn push_json(&self, message: Value) {
        self.callbacks.incoming_json(&message);
    }

    pub fn push_audio(&self, frame: Bytes) {
        self.callbacks.incoming_audio(frame);
    }

    /// Simulate the peer dropping the connection.
    pub fn disconnect(&self) {
        if self.opened.swap(false, Ordering::SeqCst) {
            self.callbacks.audio_channel_closed();
        }
    }
}

impl Protocol for FakeProtocol {
    fn callbacks(&self) -> &ProtocolCallbacks {
        &self.callbacks
    }

    fn server_sample_rate(&self) -> u32 {
        self.server_sample_rate.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    fn open_audio_channel(&self) -> bool {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.opened.store(false, Ordering::SeqCst);
        if !self.open_succeeds.load(Ordering::SeqCst) {
            self.callbacks.network_error("无法连接服务");
            return false;
        }
        self.opened.store(true, Ordering::SeqCst);
        self.callbacks.audio_channel_opened();
        true
    }

    fn close_audio_channel(&self) {
        self.disconnect();
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn send_audio(&self, frame: Bytes) {
        self.sent_audio.lock().unwrap().push(frame);
    }

    fn send_text(&self, text: &str) {
        self.sent_text.lock().unwrap().push(text.to_string());
    }
}

// ======================== Front-ends ========================

/// Shared view into a [`FakeProcessor`] after it is boxed into the app.
#[derive(Default)]
pub struct ProcessorProbe {
    pub running: AtomicBool,
    pub initialized_channels: AtomicUsize,
    output: Mutex<Option<PcmCallback>>,
}

/// Passes the mic channel straight through to its output callback.
pub struct FakeProcessor {
    pub probe: Arc<ProcessorProbe>,
    channels: usize,
}

impl FakeProcessor {
    pub fn new(probe: Arc<ProcessorProbe>) -> Self {
        Self { probe, channels: 1 }
    }
}

impl AudioProcessor for FakeProcessor {
    fn initialize(&mut self, channels: usize, _reference: bool) {
        self.channels = channels;
        self.probe
            .initialized_channels
            .store(channels, Ordering::SeqCst);
    }

    fn on_output(&mut self, callback: PcmCallback) {
        *self.probe.output.lock().unwrap() = Some(callback);
    }

    fn input(&mut self, data: &[i16]) {
        let mic = crate::audio::mic_channel(data, self.channels);
        if let Some(callback) = self.probe.output.lock().unwrap().as_ref() {
            callback(mic);
        }
    }

    fn start(&mut self) {
        self.probe.running.store(true, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.probe.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.probe.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct WakeWordProbe {
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub fed: AtomicUsize,
    pub encoded: AtomicBool,
    pub wake_frames: Mutex<VecDeque<Bytes>>,
    detected: Mutex<Option<WakeWordCallback>>,
    vad: Mutex<Option<VadCallback>>,
}

impl WakeWordProbe {
    /// Fire the detection callback as the detector thread would.
    pub fn detect(&self, wake_word: &str) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(callback) = self.detected.lock().unwrap().as_ref() {
            callback(wake_word.to_string());
        }
    }

    pub fn vad(&self, speaking: bool) {
        if let Some(callback) = self.vad.lock().unwrap().as_ref() {
            callback(speaking);
        }
    }
}

pub struct FakeWakeWord {
    pub probe: Arc<WakeWordProbe>,
}

impl WakeWordDetector for FakeWakeWord {
    fn initialize(&mut self, _channels: usize, _reference: bool) {}

    fn on_wake_word_detected(&mut self, callback: WakeWordCallback) {
        *self.probe.detected.lock().unwrap() = Some(callback);
    }

    fn on_vad_state_change(&mut self, callback: VadCallback) {
        *self.probe.vad.lock().unwrap() = Some(callback);
    }

    fn start_detection(&mut self) {
        self.probe.running.store(true, Ordering::SeqCst);
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn is_detection_running(&self) -> bool {
        self.probe.running.load(Ordering::SeqCst)
    }

    fn feed(&mut self, _data: &[i16]) {
        self.probe.fed.fetch_add(1, Ordering::SeqCst);
    }

    fn encode_wake_word_data(&mut self) {
        self.probe.encoded.store(true, Ordering::SeqCst);
    }

    fn take_wake_word_opus(&mut self) -> Option<Bytes> {
        self.probe.wake_frames.lock().unwrap().pop_front()
    }
}
