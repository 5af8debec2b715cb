//! Contracts for the optional capture front-ends: a pre-processor
//! (echo cancellation / noise suppression) and a wake-word detector.
//!
//! Both are fed 16kHz interleaved frames from the main loop and report back
//! through callbacks that may fire on any thread.

use bytes::Bytes;

pub type PcmCallback = Box<dyn Fn(Vec<i16>) + Send + Sync>;
pub type WakeWordCallback = Box<dyn Fn(String) + Send + Sync>;
pub type VadCallback = Box<dyn Fn(bool) + Send + Sync>;

pub trait AudioProcessor: Send {
    fn initialize(&mut self, channels: usize, reference: bool);
    /// Processed mono PCM ready for encoding.
    fn on_output(&mut self, callback: PcmCallback);
    fn input(&mut self, data: &[i16]);
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub trait WakeWordDetector: Send {
    fn initialize(&mut self, channels: usize, reference: bool);
    fn on_wake_word_detected(&mut self, callback: WakeWordCallback);
    fn on_vad_state_change(&mut self, callback: VadCallback);
    fn start_detection(&mut self);
    fn is_detection_running(&self) -> bool;
    fn feed(&mut self, data: &[i16]);

    /// Encode the audio buffered around the last detection.
    fn encode_wake_word_data(&mut self);
    /// Next encoded frame of the wake audio, `None` once drained.
    fn take_wake_word_opus(&mut self) -> Option<Bytes>;
}
