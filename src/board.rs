use std::sync::Arc;

use crate::audio::AudioDevice;
use crate::iot::ThingManager;
use crate::state_machine::DeviceState;

/// Status/emotion/chat surface of the device.
pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    /// `role` is "user", "assistant" or "system"; empty clears the line.
    fn set_chat_message(&self, role: &str, content: &str);
    fn show_notification(&self, message: &str);
    fn set_icon(&self, icon: &str);
}

pub trait Led: Send + Sync {
    fn on_state_changed(&self, state: DeviceState, voice_detected: bool);
}

/// Peripherals the application core drives.
#[derive(Clone)]
pub struct Board {
    pub audio: Arc<dyn AudioDevice>,
    pub display: Arc<dyn Display>,
    pub led: Arc<dyn Led>,
    pub things: Arc<dyn ThingManager>,
}
