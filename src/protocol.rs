//! Transport-agnostic session protocol: the channel contract, its callbacks
//! and the JSON control-message vocabulary.

use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::state_machine::{AbortReason, ListeningMode};
use crate::util::lock;

pub type AudioCallback = Box<dyn Fn(Bytes) + Send + Sync>;
pub type JsonCallback = Box<dyn Fn(&Value) + Send + Sync>;
pub type EventCallback = Box<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Sample rate assumed until the server hello says otherwise.
pub const DEFAULT_SERVER_SAMPLE_RATE: u32 = 16000;

/// Handlers registered by the application. Any of them may fire on a
/// transport thread.
#[derive(Default)]
pub struct ProtocolCallbacks {
    incoming_audio: Mutex<Option<AudioCallback>>,
    incoming_json: Mutex<Option<JsonCallback>>,
    audio_channel_opened: Mutex<Option<EventCallback>>,
    audio_channel_closed: Mutex<Option<EventCallback>>,
    network_error: Mutex<Option<ErrorCallback>>,
}

impl ProtocolCallbacks {
    pub fn on_incoming_audio(&self, callback: impl Fn(Bytes) + Send + Sync + 'static) {
        *lock(&self.incoming_audio) = Some(Box::new(callback));
    }

    pub fn on_incoming_json(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        *lock(&self.incoming_json) = Some(Box::new(callback));
    }

    pub fn on_audio_channel_opened(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.audio_channel_opened) = Some(Box::new(callback));
    }

    pub fn on_audio_channel_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.audio_channel_closed) = Some(Box::new(callback));
    }

    pub fn on_network_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *lock(&self.network_error) = Some(Box::new(callback));
    }

    pub fn incoming_audio(&self, frame: Bytes) {
        if let Some(callback) = lock(&self.incoming_audio).as_ref() {
            callback(frame);
        }
    }

    pub fn incoming_json(&self, message: &Value) {
        if let Some(callback) = lock(&self.incoming_json).as_ref() {
            callback(message);
        }
    }

    pub fn audio_channel_opened(&self) {
        if let Some(callback) = lock(&self.audio_channel_opened).as_ref() {
            callback();
        }
    }

    pub fn audio_channel_closed(&self) {
        if let Some(callback) = lock(&self.audio_channel_closed).as_ref() {
            callback();
        }
    }

    pub fn network_error(&self, message: &str) {
        if let Some(callback) = lock(&self.network_error).as_ref() {
            callback(message);
        }
    }
}

/// A session with the conversational backend.
///
/// All methods take `&self`; implementations synchronise internally so the
/// protocol can be shared with its own callbacks.
pub trait Protocol: Send + Sync {
    fn callbacks(&self) -> &ProtocolCallbacks;

    fn server_sample_rate(&self) -> u32;
    fn session_id(&self) -> String;

    /// Connect and complete the hello handshake. Failures are reported
    /// through the network-error callback and leave the channel closed.
    fn open_audio_channel(&self) -> bool;
    fn close_audio_channel(&self);
    fn is_audio_channel_opened(&self) -> bool;

    fn send_audio(&self, frame: Bytes);
    fn send_text(&self, text: &str);

    fn send_json(&self, message: Value) {
        self.send_text(&message.to_string());
    }

    fn send_start_listening(&self, mode: ListeningMode) {
        self.send_json(json!({
            "session_id": self.session_id(),
            "type": "listen",
            "state": "start",
            "mode": mode.as_str(),
        }));
    }

    fn send_stop_listening(&self) {
        self.send_json(json!({
            "session_id": self.session_id(),
            "type": "listen",
            "state": "stop",
        }));
    }

    fn send_abort_speaking(&self, reason: AbortReason) {
        let mut message = json!({
            "session_id": self.session_id(),
            "type": "abort",
        });
        if reason == AbortReason::WakeWordDetected {
            message["reason"] = json!("wake_word_detected");
        }
        self.send_json(message);
    }

    fn send_wake_word_detected(&self, wake_word: &str) {
        self.send_json(json!({
            "session_id": self.session_id(),
            "type": "listen",
            "state": "detect",
            "text": wake_word,
        }));
    }

    fn send_iot_descriptors(&self, descriptors: &str) {
        match serde_json::from_str::<Value>(descriptors) {
            Ok(descriptors) => self.send_json(json!({
                "session_id": self.session_id(),
                "type": "iot",
                "descriptors": descriptors,
            })),
            Err(e) => log::warn!("Invalid IoT descriptors JSON: {}", e),
        }
    }

    fn send_iot_states(&self, states: &str) {
        match serde_json::from_str::<Value>(states) {
            Ok(states) => self.send_json(json!({
                "session_id": self.session_id(),
                "type": "iot",
                "update": true,
                "states": states,
            })),
            Err(e) => log::warn!("Invalid IoT states JSON: {}", e),
        }
    }
}

// ======================== Handshake ========================

// 音频参数结构体
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

// Hello Message，用于初始化连接
#[derive(Serialize, Debug)]
pub struct ClientHello<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    version: u8,
    transport: &'a str,
    audio_params: &'a AudioParams,
}

impl<'a> ClientHello<'a> {
    pub fn new(transport: &'a str, audio_params: &'a AudioParams) -> Self {
        Self {
            msg_type: "hello",
            version: 1,
            transport,
            audio_params,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerHello {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<ServerAudioParams>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerAudioParams {
    pub sample_rate: Option<u32>,
}

// ======================== Incoming control messages ========================

/// Control messages the application reacts to. Unknown types parse as
/// [`ServerMessage::Unknown`]; missing or mistyped fields are a parse error.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        text: String,
    },
    Llm {
        emotion: String,
    },
    Iot {
        commands: Vec<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

impl ServerMessage {
    pub fn parse(message: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(message)
    }
}
