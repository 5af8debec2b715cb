//! Device state machine and main loop.
//!
//! [`Application`] lives on the `main_loop` thread and is the only writer of
//! the device state. Everything else reaches it through [`AppContext`]:
//! `schedule` for arbitrary work, event bits for the audio-ready signals.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use crate::audio::p3::{self, P3_SAMPLE_RATE};
use crate::audio::{AudioDevice, AudioPipeline, AudioProcessor, WakeWordDetector, mic_channel};
use crate::background_task::{BackgroundTask, DEFAULT_QUEUE_DEPTH};
use crate::board::{Board, Display, Led};
use crate::iot::ThingManager;
use crate::main_loop::{
    ALL_EVENTS, AUDIO_INPUT_READY_EVENT, AUDIO_OUTPUT_READY_EVENT, EventGroup, SCHEDULE_EVENT,
    SHUTDOWN_EVENT, TaskQueue,
};
use crate::protocol::{Protocol, ServerMessage, TtsState};
use crate::state_machine::{AbortReason, DeviceState, ListeningMode, StateMirror};
use crate::util::lock;

/// Bundled cue played for an alert message.
const ALERT_CUES: [(&str, &str); 3] = [
    ("PIN is not ready", "err_pin.p3"),
    ("Configuring WiFi", "err_wificonfig.p3"),
    ("Registration denied", "err_reg.p3"),
];

/// Output buffer drain time before listening after an interrupted reply.
const START_LISTENING_GRACE: Duration = Duration::from_millis(120);

const STATUS_STANDBY: &str = "Standby";
const STATUS_CONNECTING: &str = "Connecting...";
const STATUS_LISTENING: &str = "Listening...";
const STATUS_SPEAKING: &str = "Speaking...";

#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Opus frame duration for the capture path
    pub frame_duration_ms: u32,
    /// Directory holding the alert cue `.p3` files
    pub assets_dir: Option<std::path::PathBuf>,
    pub background_queue_depth: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            frame_duration_ms: 60,
            assets_dir: None,
            background_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Wake-up signals plus the deferred task queue.
pub struct Scheduler {
    events: Arc<EventGroup>,
    tasks: TaskQueue<Application>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            events: Arc::new(EventGroup::new()),
            tasks: TaskQueue::default(),
        }
    }

    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Application) + Send + 'static,
    {
        self.tasks.push(Box::new(task));
        self.events.set_bits(SCHEDULE_EVENT);
    }
}

/// Shared handle to the running application. Safe to use from any thread.
pub struct AppContext {
    scheduler: Arc<Scheduler>,
    state: StateMirror,
    pipeline: Arc<AudioPipeline>,
    background: BackgroundTask,
    device: Arc<dyn AudioDevice>,
    display: Arc<dyn Display>,
    led: Arc<dyn Led>,
    things: Arc<dyn ThingManager>,
    last_iot_states: Mutex<String>,
    alert_cues: HashMap<&'static str, Bytes>,
}

impl AppContext {
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Application) + Send + 'static,
    {
        self.scheduler.schedule(task);
    }

    /// Last state published by the main loop. May lag behind by one task.
    pub fn device_state(&self) -> DeviceState {
        self.state.load()
    }

    pub fn display(&self) -> &Arc<dyn Display> {
        &self.display
    }

    pub fn toggle_chat_state(&self) {
        self.schedule(|app| app.toggle_chat_state());
    }

    pub fn start_listening(&self) {
        self.schedule(|app| app.start_listening());
    }

    pub fn stop_listening(&self) {
        self.schedule(|app| app.stop_listening());
    }

    /// Interrupt the current reply, if any.
    pub fn abort_speaking(&self) {
        self.schedule(|app| {
            if app.device_state == DeviceState::Speaking {
                app.abort_speaking(AbortReason::None);
            }
        });
    }

    /// Stop the main loop after its current wake-up.
    pub fn shutdown(&self) {
        self.scheduler.events.set_bits(SHUTDOWN_EVENT);
    }

    /// Show `message` and play its bundled cue, if it has one.
    ///
    /// Blocks on the background barrier; never call it from a background job.
    pub fn alert(&self, title: &str, message: &str) {
        log::warn!("Alert: {}, {}", title, message);
        self.display.show_notification(message);

        if let Some(cue) = self.alert_cues.get(message) {
            self.play_local(cue);
        }
    }

    fn play_local(&self, data: &Bytes) {
        self.background.wait_for_completion();
        if let Err(e) = self.pipeline.set_decode_sample_rate(P3_SAMPLE_RATE) {
            log::warn!("{:#}", e);
            return;
        }
        let frames = p3::parse(data);
        log::info!("Playing cue: {} bytes, {} frames", data.len(), frames.len());
        self.pipeline.enable_output(true);
        self.pipeline.enqueue_local(frames);
    }

    /// Encode mono PCM on the background executor and send each packet from
    /// the main loop.
    fn encode_and_send(&self, pcm: Vec<i16>) {
        let pipeline = self.pipeline.clone();
        let scheduler = self.scheduler.clone();
        self.background.schedule(move || {
            pipeline.encode(&pcm, |frame| {
                scheduler.schedule(move |app| app.protocol.send_audio(frame));
            });
        });
    }

    fn on_audio_channel_opened(&self, protocol: &dyn Protocol) {
        let server_rate = protocol.server_sample_rate();
        if server_rate != self.device.output_sample_rate() {
            log::warn!(
                "Server sample rate {} differs from device output rate {}, playback will be resampled",
                server_rate,
                self.device.output_sample_rate()
            );
        }
        self.background.wait_for_completion();
        if let Err(e) = self.pipeline.set_decode_sample_rate(server_rate) {
            log::error!("{:#}", e);
        }

        // 物联网设备描述符
        lock(&self.last_iot_states).clear();
        protocol.send_iot_descriptors(&self.things.descriptors_json());
    }
}

fn load_alert_cues(dir: &Path) -> HashMap<&'static str, Bytes> {
    let mut cues = HashMap::new();
    for (message, file) in ALERT_CUES {
        match p3::load(&dir.join(file)) {
            Ok(data) => {
                cues.insert(message, data);
            }
            Err(e) => log::warn!("Alert cue unavailable: {:#}", e),
        }
    }
    cues
}

pub struct Application {
    ctx: Arc<AppContext>,
    protocol: Arc<dyn Protocol>,
    device_state: DeviceState,
    keep_listening: bool,
    voice_detected: bool,
    processor: Option<Box<dyn AudioProcessor>>,
    wake_word: Option<Box<dyn WakeWordDetector>>,
}

impl Application {
    pub fn new(board: Board, protocol: Arc<dyn Protocol>, options: &AppOptions) -> Result<Self> {
        let pipeline = Arc::new(AudioPipeline::new(
            board.audio.clone(),
            options.frame_duration_ms,
        )?);
        let alert_cues = options
            .assets_dir
            .as_deref()
            .map(load_alert_cues)
            .unwrap_or_default();

        let ctx = Arc::new(AppContext {
            scheduler: Arc::new(Scheduler::new()),
            state: StateMirror::new(DeviceState::Unknown),
            pipeline,
            background: BackgroundTask::new(options.background_queue_depth)?,
            device: board.audio,
            display: board.display,
            led: board.led,
            things: board.things,
            last_iot_states: Mutex::new(String::new()),
            alert_cues,
        });

        Ok(Self {
            ctx,
            protocol,
            device_state: DeviceState::Unknown,
            keep_listening: false,
            voice_detected: false,
            processor: None,
            wake_word: None,
        })
    }

    pub fn with_audio_processor(mut self, processor: Box<dyn AudioProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_wake_word_detector(mut self, detector: Box<dyn WakeWordDetector>) -> Self {
        self.wake_word = Some(detector);
        self
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.ctx.clone()
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    /// Wire callbacks and start the audio device. Must run on the thread
    /// that will call [`Application::run`].
    pub fn start(&mut self) -> Result<()> {
        self.set_device_state(DeviceState::Starting);

        let device = self.ctx.device.clone();
        {
            let events = self.ctx.scheduler.events.clone();
            device.on_input_ready(Box::new(move || events.set_bits(AUDIO_INPUT_READY_EVENT)));
            let events = self.ctx.scheduler.events.clone();
            device.on_output_ready(Box::new(move || events.set_bits(AUDIO_OUTPUT_READY_EVENT)));
        }

        if let Some(processor) = self.processor.as_mut() {
            processor.initialize(device.input_channels(), device.input_reference());
            let ctx = self.ctx.clone();
            processor.on_output(Box::new(move |pcm| ctx.encode_and_send(pcm)));
        }

        if let Some(detector) = self.wake_word.as_mut() {
            detector.initialize(device.input_channels(), device.input_reference());
            let ctx = self.ctx.clone();
            detector.on_vad_state_change(Box::new(move |speaking| {
                ctx.schedule(move |app| app.on_vad_state_change(speaking));
            }));
            let ctx = self.ctx.clone();
            detector.on_wake_word_detected(Box::new(move |wake_word| {
                ctx.schedule(move |app| app.on_wake_word_detected(wake_word));
            }));
            detector.start_detection();
        }

        self.register_protocol_callbacks();

        device.start()?;
        self.set_device_state(DeviceState::Idle);
        Ok(())
    }

    fn register_protocol_callbacks(&self) {
        let callbacks = self.protocol.callbacks();

        let ctx = self.ctx.clone();
        callbacks.on_network_error(move |message| ctx.alert("Error", message));

        let ctx = self.ctx.clone();
        callbacks.on_incoming_audio(move |frame| {
            ctx.pipeline.enqueue_incoming(frame, ctx.device_state());
        });

        let ctx = self.ctx.clone();
        let protocol: Weak<dyn Protocol> = Arc::downgrade(&self.protocol);
        callbacks.on_audio_channel_opened(move || {
            if let Some(protocol) = protocol.upgrade() {
                ctx.on_audio_channel_opened(protocol.as_ref());
            }
        });

        let ctx = self.ctx.clone();
        callbacks.on_audio_channel_closed(move || {
            ctx.schedule(|app| {
                app.ctx.display.set_chat_message("system", "");
                app.set_device_state(DeviceState::Idle);
            });
        });

        let ctx = self.ctx.clone();
        callbacks.on_incoming_json(move |root| match ServerMessage::parse(root) {
            Ok(message) => ctx.schedule(move |app| app.handle_server_message(message)),
            Err(e) => log::warn!("Ignoring malformed message: {}, data: {}", e, root),
        });
    }

    /// Run the main loop until shutdown.
    pub fn run(mut self) {
        log::info!("Main loop started");
        while self.run_once(None) {}
        self.protocol.close_audio_channel();
        log::info!("Main loop stopped");
    }

    /// Wait for one wake-up and handle it: input, then output, then the
    /// tasks queued so far. Returns `false` once shutdown was requested.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> bool {
        let bits = self.ctx.scheduler.events.wait_bits(ALL_EVENTS, timeout);

        if bits & AUDIO_INPUT_READY_EVENT != 0 {
            self.input_audio();
        }
        if bits & AUDIO_OUTPUT_READY_EVENT != 0 {
            self.output_audio();
        }
        if bits & SCHEDULE_EVENT != 0 {
            for task in self.ctx.scheduler.tasks.take_all() {
                task(self);
            }
        }
        bits & SHUTDOWN_EVENT == 0
    }

    // ======================== State machine ========================

    pub fn set_device_state(&mut self, state: DeviceState) {
        if self.device_state == state {
            return;
        }

        self.device_state = state;
        self.ctx.state.store(state);
        log::info!("STATE: {}", state);
        // 状态改变，等待所有后台任务完成
        self.ctx.background.wait_for_completion();

        let display = self.ctx.display.clone();
        self.ctx.led.on_state_changed(state, self.voice_detected);
        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                display.set_status(STATUS_STANDBY);
                display.set_emotion("neutral");
                display.set_chat_message("", "");
                if let Some(processor) = self.processor.as_mut() {
                    processor.stop();
                }
            }
            DeviceState::Connecting => {
                display.set_status(STATUS_CONNECTING);
            }
            DeviceState::Listening => {
                display.set_status(STATUS_LISTENING);
                display.set_emotion("neutral");
                self.ctx.pipeline.reset_decoder();
                self.ctx.pipeline.reset_encoder();
                if let Some(processor) = self.processor.as_mut() {
                    processor.start();
                }
                self.update_iot_states();
            }
            DeviceState::Speaking => {
                display.set_status(STATUS_SPEAKING);
                self.ctx.pipeline.reset_decoder();
                if let Some(processor) = self.processor.as_mut() {
                    processor.stop();
                }
            }
            _ => {}
        }
    }

    /// Enter `Upgrading` if the device is idle. Returns whether it did.
    pub fn begin_upgrade(&mut self, version: &str) -> bool {
        if self.device_state != DeviceState::Idle {
            return false;
        }
        self.set_device_state(DeviceState::Upgrading);
        self.ctx.display.set_icon("download");
        self.ctx.display.set_status(&format!("新版本 {}", version));
        // 关闭音频输出，避免升级过程中的音频操作
        self.ctx.pipeline.enable_output(false);
        true
    }

    fn open_audio_channel(&mut self) -> bool {
        if self.protocol.open_audio_channel() {
            return true;
        }
        self.ctx.alert("Error", "Failed to open audio channel");
        self.set_device_state(DeviceState::Idle);
        false
    }

    fn toggle_chat_state(&mut self) {
        match self.device_state {
            DeviceState::Idle => {
                self.set_device_state(DeviceState::Connecting);
                if !self.open_audio_channel() {
                    return;
                }
                self.keep_listening = true;
                self.protocol.send_start_listening(ListeningMode::AutoStop);
                self.set_device_state(DeviceState::Listening);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.protocol.close_audio_channel(),
            _ => {}
        }
    }

    fn start_listening(&mut self) {
        self.keep_listening = false;
        match self.device_state {
            DeviceState::Idle => {
                if !self.protocol.is_audio_channel_opened() {
                    self.set_device_state(DeviceState::Connecting);
                    if !self.open_audio_channel() {
                        return;
                    }
                }
                self.protocol.send_start_listening(ListeningMode::ManualStop);
                self.set_device_state(DeviceState::Listening);
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.protocol.send_start_listening(ListeningMode::ManualStop);
                thread::sleep(START_LISTENING_GRACE);
                self.set_device_state(DeviceState::Listening);
            }
            _ => {}
        }
    }

    fn stop_listening(&mut self) {
        if self.device_state == DeviceState::Listening {
            self.protocol.send_stop_listening();
            self.set_device_state(DeviceState::Idle);
        }
    }

    fn abort_speaking(&mut self, reason: AbortReason) {
        log::info!("Abort speaking");
        self.ctx.pipeline.set_aborted(true);
        self.protocol.send_abort_speaking(reason);
    }

    fn update_iot_states(&mut self) {
        let states = self.ctx.things.states_json();
        let mut last = lock(&self.ctx.last_iot_states);
        if *last != states {
            self.protocol.send_iot_states(&states);
            *last = states;
        }
    }

    // ======================== Incoming messages ========================

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Tts { state, text } => match state {
                TtsState::Start => {
                    self.ctx.pipeline.set_aborted(false);
                    if matches!(self.device_state, DeviceState::Idle | DeviceState::Listening) {
                        self.set_device_state(DeviceState::Speaking);
                    }
                }
                TtsState::Stop => {
                    if self.device_state == DeviceState::Speaking {
                        self.ctx.background.wait_for_completion();
                        if self.keep_listening {
                            self.protocol.send_start_listening(ListeningMode::AutoStop);
                            self.set_device_state(DeviceState::Listening);
                        } else {
                            self.set_device_state(DeviceState::Idle);
                        }
                    }
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        log::info!("<< {}", text);
                        self.ctx.display.set_chat_message("assistant", &text);
                    }
                }
                TtsState::Other => {}
            },
            ServerMessage::Stt { text } => {
                log::info!(">> {}", text);
                self.ctx.display.set_chat_message("user", &text);
            }
            ServerMessage::Llm { emotion } => self.ctx.display.set_emotion(&emotion),
            ServerMessage::Iot { commands } => {
                for command in &commands {
                    self.ctx.things.invoke(command);
                }
            }
            ServerMessage::Unknown => log::debug!("Unhandled message type"),
        }
    }

    // ======================== Wake word ========================

    fn on_wake_word_detected(&mut self, wake_word: String) {
        match self.device_state {
            DeviceState::Idle => {
                self.set_device_state(DeviceState::Connecting);
                if let Some(detector) = self.wake_word.as_mut() {
                    detector.encode_wake_word_data();
                }

                if !self.protocol.open_audio_channel() {
                    log::error!("Failed to open audio channel");
                    self.set_device_state(DeviceState::Idle);
                    self.restart_wake_word_detection();
                    return;
                }

                // 编码并发送唤醒词数据到服务器
                while let Some(frame) = self
                    .wake_word
                    .as_mut()
                    .and_then(|detector| detector.take_wake_word_opus())
                {
                    self.protocol.send_audio(frame);
                }
                self.protocol.send_wake_word_detected(&wake_word);
                log::info!("Wake word detected: {}", wake_word);
                self.keep_listening = true;
                self.set_device_state(DeviceState::Listening);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => {}
        }
        self.restart_wake_word_detection();
    }

    fn restart_wake_word_detection(&mut self) {
        if let Some(detector) = self.wake_word.as_mut() {
            detector.start_detection();
        }
    }

    fn on_vad_state_change(&mut self, speaking: bool) {
        if self.device_state == DeviceState::Listening {
            self.voice_detected = speaking;
            self.ctx.led.on_state_changed(self.device_state, speaking);
        }
    }

    // ======================== Audio ========================

    fn input_audio(&mut self) {
        let data = match self.ctx.pipeline.read_input() {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Dropping input frame: {:#}", e);
                return;
            }
        };

        if let Some(processor) = self.processor.as_mut()
            && processor.is_running()
        {
            processor.input(&data);
        }
        if let Some(detector) = self.wake_word.as_mut()
            && detector.is_detection_running()
        {
            detector.feed(&data);
        }

        if self.processor.is_none() && self.device_state == DeviceState::Listening {
            let pcm = mic_channel(&data, self.ctx.device.input_channels());
            self.ctx.encode_and_send(pcm);
        }
    }

    fn output_audio(&mut self) {
        if let Some(frame) = self.ctx.pipeline.next_output_frame(self.device_state) {
            let pipeline = self.ctx.pipeline.clone();
            self.ctx
                .background
                .schedule(move || pipeline.decode_and_play(&frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeAudioDevice, FakeBoard, FakeProcessor, FakeProtocol, FakeWakeWord, ProcessorProbe,
        WakeWordProbe, encode_frames, sine_wave,
    };
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    struct Harness {
        app: Application,
        ctx: Arc<AppContext>,
        board: FakeBoard,
        protocol: Arc<FakeProtocol>,
    }

    fn harness_with(device: FakeAudioDevice, options: AppOptions) -> Harness {
        let board = FakeBoard::new(device);
        let protocol = Arc::new(FakeProtocol::new());
        let app = Application::new(board.board(), protocol.clone(), &options).unwrap();
        let ctx = app.context();
        Harness {
            app,
            ctx,
            board,
            protocol,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeAudioDevice::new(16000, 16000, 1), AppOptions::default())
    }

    fn started() -> Harness {
        let mut h = harness();
        h.app.start().unwrap();
        h
    }

    /// Run the loop until scheduled work and background jobs have drained.
    fn settle(h: &mut Harness) {
        for _ in 0..5 {
            h.app.run_once(Some(Duration::from_millis(10)));
            h.ctx.background.wait_for_completion();
        }
    }

    fn listening(h: &mut Harness) {
        h.ctx.toggle_chat_state();
        settle(h);
        assert_eq!(h.app.device_state(), DeviceState::Listening);
    }

    fn push(h: &mut Harness, message: Value) {
        h.protocol.push_json(message);
        settle(h);
    }

    fn iot_state_updates(protocol: &FakeProtocol) -> usize {
        protocol
            .sent_of_type("iot")
            .iter()
            .filter(|m| m["update"] == true)
            .count()
    }

    #[test]
    fn start_enters_idle() {
        let h = started();
        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert_eq!(h.ctx.device_state(), DeviceState::Idle);
        assert!(h.board.audio.is_started());
        assert_eq!(
            *h.board.led.changes.lock().unwrap(),
            vec![(DeviceState::Starting, false), (DeviceState::Idle, false)]
        );
        assert_eq!(h.board.display.last_status().as_deref(), Some(STATUS_STANDBY));
    }

    #[test]
    fn toggle_opens_channel_and_listens() {
        let mut h = started();
        h.protocol.set_session_id("s1");
        listening(&mut h);

        assert_eq!(h.protocol.open_calls(), 1);
        let sent = h.protocol.sent_json();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0]["descriptors"], json!([{"name": "Lamp"}]));
        assert_eq!(
            sent[1],
            json!({"session_id": "s1", "type": "listen", "state": "start", "mode": "auto"})
        );
        assert_eq!(sent[2]["update"], true);

        let states: Vec<_> = h.board.led.changes.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(
            states,
            vec![
                DeviceState::Starting,
                DeviceState::Idle,
                DeviceState::Connecting,
                DeviceState::Listening
            ]
        );
        assert_eq!(h.board.display.last_status().as_deref(), Some(STATUS_LISTENING));
    }

    #[test]
    fn toggle_open_failure_alerts_and_returns_to_idle() {
        let mut h = started();
        h.protocol.set_open_succeeds(false);
        h.ctx.toggle_chat_state();
        settle(&mut h);

        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert_eq!(
            *h.board.display.notifications.lock().unwrap(),
            vec!["无法连接服务".to_string(), "Failed to open audio channel".to_string()]
        );
        assert!(h.protocol.sent_of_type("listen").is_empty());
    }

    #[test]
    fn toggle_while_listening_closes_channel() {
        let mut h = started();
        listening(&mut h);

        h.ctx.toggle_chat_state();
        settle(&mut h);
        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert!(!h.protocol.is_audio_channel_opened());
        assert!(
            h.board
                .display
                .chat
                .lock()
                .unwrap()
                .contains(&("system".to_string(), String::new()))
        );
    }

    #[test]
    fn reply_plays_and_resumes_listening() {
        let mut h = started();
        listening(&mut h);

        push(&mut h, json!({"type": "tts", "state": "start"}));
        assert_eq!(h.app.device_state(), DeviceState::Speaking);

        for frame in encode_frames(2) {
            h.protocol.push_audio(frame);
        }
        for _ in 0..2 {
            h.board.audio.fire_output_ready();
            settle(&mut h);
        }
        let played = h.board.audio.played();
        assert_eq!(played.len(), 2);
        assert!(played.iter().all(|pcm| pcm.len() == 960));

        h.protocol.clear_sent();
        push(&mut h, json!({"type": "tts", "state": "stop"}));
        assert_eq!(h.app.device_state(), DeviceState::Listening);
        assert_eq!(h.protocol.sent_of_type("listen")[0]["mode"], "auto");
    }

    #[test]
    fn reply_without_keep_listening_ends_idle() {
        let mut h = started();
        h.ctx.start_listening();
        settle(&mut h);
        assert_eq!(h.app.device_state(), DeviceState::Listening);
        assert_eq!(h.protocol.sent_of_type("listen")[0]["mode"], "manual");

        push(&mut h, json!({"type": "tts", "state": "start"}));
        push(&mut h, json!({"type": "tts", "state": "stop"}));
        assert_eq!(h.app.device_state(), DeviceState::Idle);
    }

    #[test]
    fn start_listening_while_speaking_aborts_first() {
        let mut h = started();
        h.protocol.set_session_id("s2");
        h.ctx.start_listening();
        settle(&mut h);
        push(&mut h, json!({"type": "tts", "state": "start"}));
        h.protocol.clear_sent();

        let start = Instant::now();
        h.ctx.start_listening();
        settle(&mut h);
        assert!(start.elapsed() >= START_LISTENING_GRACE);

        assert_eq!(
            h.protocol.sent_json()[..2],
            [
                json!({"session_id": "s2", "type": "abort"}),
                json!({"session_id": "s2", "type": "listen", "state": "start", "mode": "manual"}),
            ]
        );
        assert_eq!(h.app.device_state(), DeviceState::Listening);
    }

    #[test]
    fn stop_listening_only_acts_while_listening() {
        let mut h = started();
        h.ctx.stop_listening();
        settle(&mut h);
        assert!(h.protocol.sent_json().is_empty());

        h.ctx.start_listening();
        settle(&mut h);
        h.ctx.stop_listening();
        settle(&mut h);
        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert_eq!(h.protocol.sent_of_type("listen").last().unwrap()["state"], "stop");
    }

    #[test]
    fn state_change_waits_for_background_jobs() {
        let mut h = started();
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            h.ctx.background.schedule(move || {
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            });
        }
        h.app.set_device_state(DeviceState::Connecting);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(
            h.board.led.changes.lock().unwrap().last(),
            Some(&(DeviceState::Connecting, false))
        );

        // same state is a no-op
        h.app.set_device_state(DeviceState::Connecting);
        assert_eq!(h.board.led.changes.lock().unwrap().len(), 3);
    }

    #[test]
    fn iot_states_are_sent_only_when_changed() {
        let mut h = started();
        listening(&mut h);
        assert_eq!(iot_state_updates(&h.protocol), 1);

        push(&mut h, json!({"type": "tts", "state": "start"}));
        push(&mut h, json!({"type": "tts", "state": "stop"}));
        assert_eq!(h.app.device_state(), DeviceState::Listening);
        assert_eq!(iot_state_updates(&h.protocol), 1);

        *h.board.things.states.lock().unwrap() =
            r#"[{"name":"Lamp","state":{"power":true}}]"#.into();
        push(&mut h, json!({"type": "tts", "state": "start"}));
        push(&mut h, json!({"type": "tts", "state": "stop"}));
        assert_eq!(iot_state_updates(&h.protocol), 2);

        // a new channel clears the cache and re-sends descriptors
        h.protocol.disconnect();
        settle(&mut h);
        listening(&mut h);
        assert_eq!(iot_state_updates(&h.protocol), 3);
        let descriptors = h
            .protocol
            .sent_of_type("iot")
            .iter()
            .filter(|m| m.get("descriptors").is_some())
            .count();
        assert_eq!(descriptors, 2);
    }

    #[test]
    fn abort_cancels_queued_decode_jobs() {
        let mut h = started();
        listening(&mut h);
        push(&mut h, json!({"type": "tts", "state": "start"}));

        let frames = encode_frames(3);
        h.protocol.push_audio(frames[0].clone());
        h.protocol.push_audio(frames[1].clone());

        // hold the worker so both decode jobs sit in the queue
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        h.ctx.background.schedule(move || {
            let _ = gate_rx.recv();
        });
        for _ in 0..2 {
            h.board.audio.fire_output_ready();
            h.app.run_once(Some(Duration::from_millis(10)));
        }

        h.ctx.abort_speaking();
        h.app.run_once(Some(Duration::from_millis(10)));
        assert_eq!(h.protocol.sent_of_type("abort").len(), 1);

        gate_tx.send(()).unwrap();
        h.ctx.background.wait_for_completion();
        assert!(h.board.audio.played().is_empty());

        // next reply clears the flag
        push(&mut h, json!({"type": "tts", "state": "start"}));
        h.protocol.push_audio(frames[2].clone());
        h.board.audio.fire_output_ready();
        settle(&mut h);
        assert_eq!(h.board.audio.played().len(), 1);
    }

    #[test]
    fn incoming_audio_is_dropped_outside_speaking() {
        let mut h = started();
        listening(&mut h);
        for frame in encode_frames(2) {
            h.protocol.push_audio(frame);
        }
        h.board.audio.fire_output_ready();
        settle(&mut h);
        assert!(h.board.audio.played().is_empty());
    }

    #[test]
    fn wake_word_in_idle_uploads_wake_audio() {
        let probe = Arc::new(WakeWordProbe::default());
        probe
            .wake_frames
            .lock()
            .unwrap()
            .extend([Bytes::from_static(b"w1"), Bytes::from_static(b"w2")]);
        let mut h = harness();
        h.app = h
            .app
            .with_wake_word_detector(Box::new(FakeWakeWord { probe: probe.clone() }));
        h.app.start().unwrap();
        assert_eq!(probe.starts.load(Ordering::SeqCst), 1);

        probe.detect("你好小智");
        settle(&mut h);

        assert!(probe.encoded.load(Ordering::SeqCst));
        assert_eq!(
            h.protocol.sent_audio(),
            vec![Bytes::from_static(b"w1"), Bytes::from_static(b"w2")]
        );
        let detect = &h.protocol.sent_of_type("listen")[0];
        assert_eq!(detect["state"], "detect");
        assert_eq!(detect["text"], "你好小智");
        assert_eq!(h.app.device_state(), DeviceState::Listening);
        assert!(h.app.keep_listening);
        assert_eq!(probe.starts.load(Ordering::SeqCst), 2);

        probe.vad(true);
        settle(&mut h);
        assert_eq!(
            h.board.led.changes.lock().unwrap().last(),
            Some(&(DeviceState::Listening, true))
        );

        push(&mut h, json!({"type": "tts", "state": "start"}));
        probe.detect("你好小智");
        settle(&mut h);
        assert_eq!(
            h.protocol.sent_of_type("abort").last().unwrap()["reason"],
            "wake_word_detected"
        );
    }

    #[test]
    fn wake_word_open_failure_restarts_detection() {
        let probe = Arc::new(WakeWordProbe::default());
        let mut h = harness();
        h.app = h
            .app
            .with_wake_word_detector(Box::new(FakeWakeWord { probe: probe.clone() }));
        h.app.start().unwrap();
        h.protocol.set_open_succeeds(false);

        probe.detect("hi");
        settle(&mut h);
        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert!(probe.running.load(Ordering::SeqCst));
        assert!(h.protocol.sent_of_type("listen").is_empty());
    }

    #[test]
    fn vad_outside_listening_is_ignored() {
        let probe = Arc::new(WakeWordProbe::default());
        let mut h = harness();
        h.app = h
            .app
            .with_wake_word_detector(Box::new(FakeWakeWord { probe: probe.clone() }));
        h.app.start().unwrap();
        let before = h.board.led.changes.lock().unwrap().len();
        probe.vad(true);
        settle(&mut h);
        assert_eq!(h.board.led.changes.lock().unwrap().len(), before);
        assert!(!h.app.voice_detected);
    }

    /// Assets directory holding a two-frame `err_pin.p3` cue.
    fn cue_assets() -> (tempfile::TempDir, AppOptions) {
        let dir = tempfile::tempdir().unwrap();
        let mut blob = Vec::new();
        for frame in encode_frames(2) {
            blob.extend_from_slice(&[0, 0]);
            blob.extend_from_slice(&(frame.len() as u16).to_be_bytes());
            blob.extend_from_slice(&frame);
        }
        std::fs::write(dir.path().join("err_pin.p3"), blob).unwrap();

        let options = AppOptions {
            assets_dir: Some(dir.path().to_path_buf()),
            ..AppOptions::default()
        };
        (dir, options)
    }

    #[test]
    fn alert_plays_bundled_cue_at_16k() {
        let (_dir, options) = cue_assets();
        let mut h = harness_with(FakeAudioDevice::new(16000, 16000, 1), options);
        h.app.start().unwrap();

        // leave the decoder at the server's rate first
        h.protocol.set_server_sample_rate(24000);
        listening(&mut h);
        assert_eq!(h.ctx.pipeline.decode_sample_rate(), 24000);
        h.protocol.disconnect();
        settle(&mut h);

        h.ctx.alert("Error", "Something else");
        assert!(h.ctx.pipeline.next_output_frame(DeviceState::Idle).is_none());

        h.ctx.alert("Error", "PIN is not ready");
        assert_eq!(h.ctx.pipeline.decode_sample_rate(), 16000);
        assert!(
            h.board
                .display
                .notifications
                .lock()
                .unwrap()
                .contains(&"PIN is not ready".to_string())
        );
        for _ in 0..2 {
            h.board.audio.fire_output_ready();
            settle(&mut h);
        }
        assert_eq!(h.board.audio.played().len(), 2);
    }

    #[test]
    fn cue_plays_after_interrupted_reply() {
        let (_dir, options) = cue_assets();
        let mut h = harness_with(FakeAudioDevice::new(16000, 16000, 1), options);
        h.app.start().unwrap();

        h.ctx.start_listening();
        settle(&mut h);
        push(&mut h, json!({"type": "tts", "state": "start"}));
        assert_eq!(h.app.device_state(), DeviceState::Speaking);

        // abort, then Listening resets the decoder
        h.ctx.start_listening();
        settle(&mut h);
        assert_eq!(h.protocol.sent_of_type("abort").len(), 1);
        h.ctx.stop_listening();
        settle(&mut h);
        assert_eq!(h.app.device_state(), DeviceState::Idle);

        h.ctx.alert("Error", "PIN is not ready");
        for _ in 0..2 {
            h.board.audio.fire_output_ready();
            settle(&mut h);
        }
        assert_eq!(h.board.audio.played().len(), 2);
    }

    #[test]
    fn one_wake_handles_input_then_output_then_tasks() {
        let mut h = started();
        listening(&mut h);
        push(&mut h, json!({"type": "tts", "state": "start"}));
        assert_eq!(h.app.device_state(), DeviceState::Speaking);

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            let audio = h.board.audio.clone();
            // queued before the ready signals, still runs after both handlers
            h.ctx.schedule(move |app| {
                let pipeline = &app.ctx.pipeline;
                let output_taken = pipeline.next_output_frame(DeviceState::Speaking).is_none();
                *seen.lock().unwrap() = Some((audio.pending_inputs(), output_taken));
            });
        }
        h.board.audio.push_input(sine_wave(440.0, 16000, 960));
        h.ctx.pipeline.enqueue_local(encode_frames(1));
        h.board.audio.fire_input_ready();
        h.board.audio.fire_output_ready();

        assert!(h.app.run_once(Some(Duration::from_millis(10))));
        assert_eq!(*seen.lock().unwrap(), Some((0, true)));
        h.ctx.background.wait_for_completion();
        assert_eq!(h.board.audio.played().len(), 1);
    }

    #[test]
    fn mic_is_encoded_only_while_listening() {
        let mut h = started();
        h.board.audio.push_input(sine_wave(440.0, 16000, 960));
        h.board.audio.fire_input_ready();
        settle(&mut h);
        assert!(h.protocol.sent_audio().is_empty());

        listening(&mut h);
        h.board.audio.push_input(sine_wave(440.0, 16000, 960));
        h.board.audio.fire_input_ready();
        settle(&mut h);
        assert_eq!(h.protocol.sent_audio().len(), 1);
    }

    #[test]
    fn dual_channel_input_encodes_mic_only() {
        let mut h = harness_with(FakeAudioDevice::new(16000, 16000, 2), AppOptions::default());
        h.app.start().unwrap();
        listening(&mut h);

        let frame: Vec<i16> = sine_wave(440.0, 16000, 960)
            .into_iter()
            .flat_map(|m| [m, 0])
            .collect();
        h.board.audio.push_input(frame);
        h.board.audio.fire_input_ready();
        settle(&mut h);
        // 960 mono samples make exactly one 60ms packet
        assert_eq!(h.protocol.sent_audio().len(), 1);
    }

    #[test]
    fn processor_output_is_encoded_and_sent() {
        let probe = Arc::new(ProcessorProbe::default());
        let mut h = harness();
        h.app = h
            .app
            .with_audio_processor(Box::new(FakeProcessor::new(probe.clone())));
        h.app.start().unwrap();
        assert_eq!(probe.initialized_channels.load(Ordering::SeqCst), 1);
        assert!(!probe.running.load(Ordering::SeqCst));

        listening(&mut h);
        assert!(probe.running.load(Ordering::SeqCst));
        h.board.audio.push_input(sine_wave(440.0, 16000, 960));
        h.board.audio.fire_input_ready();
        settle(&mut h);
        assert_eq!(h.protocol.sent_audio().len(), 1);

        push(&mut h, json!({"type": "tts", "state": "start"}));
        assert!(!probe.running.load(Ordering::SeqCst));
    }

    #[test]
    fn display_and_iot_messages() {
        let mut h = started();
        push(&mut h, json!({"type": "stt", "text": "今天天气怎么样"}));
        push(&mut h, json!({"type": "tts", "state": "sentence_start", "text": "晴天"}));
        push(&mut h, json!({"type": "llm", "emotion": "happy"}));
        push(
            &mut h,
            json!({"type": "iot", "commands": [{"name": "Lamp", "method": "TurnOn"}]}),
        );

        let chat = h.board.display.chat.lock().unwrap().clone();
        assert!(chat.contains(&("user".to_string(), "今天天气怎么样".to_string())));
        assert!(chat.contains(&("assistant".to_string(), "晴天".to_string())));
        assert_eq!(
            h.board.display.emotions.lock().unwrap().last().map(String::as_str),
            Some("happy")
        );
        assert_eq!(
            *h.board.things.invoked.lock().unwrap(),
            vec![json!({"name": "Lamp", "method": "TurnOn"})]
        );
    }

    #[test]
    fn malformed_and_unknown_messages_are_ignored() {
        let mut h = started();
        let chat_before = h.board.display.chat.lock().unwrap().len();
        push(&mut h, json!({"type": "stt"}));
        push(&mut h, json!({"type": "goodbye"}));
        push(&mut h, json!({"type": "tts", "state": 5}));
        assert_eq!(h.app.device_state(), DeviceState::Idle);
        assert_eq!(h.board.display.chat.lock().unwrap().len(), chat_before);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut h = started();
        assert!(h.app.run_once(Some(Duration::from_millis(5))));
        h.ctx.shutdown();
        assert!(!h.app.run_once(Some(Duration::from_millis(5))));
    }

    #[test]
    fn main_loop_thread_end_to_end() {
        let Harness {
            app, ctx, protocol, ..
        } = started();
        let handle = thread::Builder::new()
            .name("main_loop".into())
            .spawn(move || app.run())
            .unwrap();

        let wait_for = |state: DeviceState| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while ctx.device_state() != state && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            ctx.device_state()
        };

        ctx.toggle_chat_state();
        assert_eq!(wait_for(DeviceState::Listening), DeviceState::Listening);
        protocol.push_json(json!({"type": "tts", "state": "start"}));
        assert_eq!(wait_for(DeviceState::Speaking), DeviceState::Speaking);
        protocol.push_json(json!({"type": "tts", "state": "stop"}));
        assert_eq!(wait_for(DeviceState::Listening), DeviceState::Listening);
        ctx.stop_listening();
        assert_eq!(wait_for(DeviceState::Idle), DeviceState::Idle);

        ctx.shutdown();
        handle.join().unwrap();
        assert!(!protocol.is_audio_channel_opened());
    }
}
