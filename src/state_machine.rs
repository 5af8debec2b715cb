use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 设备状态，整个设备唯一的权威状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Unknown = 0,
    Starting = 1,
    Configuring = 2,
    Idle = 3,
    Connecting = 4,
    Listening = 5,
    Speaking = 6,
    Upgrading = 7,
    FatalError = 8,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Starting => "starting",
            DeviceState::Configuring => "configuring",
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::Upgrading => "upgrading",
            DeviceState::FatalError => "fatal_error",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Starting,
            2 => DeviceState::Configuring,
            3 => DeviceState::Idle,
            4 => DeviceState::Connecting,
            5 => DeviceState::Listening,
            6 => DeviceState::Speaking,
            7 => DeviceState::Upgrading,
            8 => DeviceState::FatalError,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only mirror of the device state for threads other than the main loop.
///
/// Only the main loop stores into it; everyone else may observe a slightly
/// stale value.
#[derive(Debug)]
pub struct StateMirror(AtomicU8);

impl StateMirror {
    pub fn new(state: DeviceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: DeviceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// 聆听模式，作为 start-listening 消息的参数发送
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    /// Server ends listening when it detects the end of speech
    AutoStop,
    /// Listening continues until an explicit stop
    ManualStop,
    /// Continuous listening; needs echo cancellation upstream. Never issued
    /// by the application today.
    #[allow(dead_code)]
    AlwaysOn,
}

impl ListeningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ListeningMode::AutoStop => "auto",
            ListeningMode::ManualStop => "manual",
            ListeningMode::AlwaysOn => "realtime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}
