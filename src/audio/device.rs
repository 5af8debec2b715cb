use anyhow::Result;

/// Called from device threads when a frame can be read or written.
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Duplex audio peripheral.
///
/// Input frames are interleaved `i16`; with two channels the first is the
/// microphone and the second the playback reference.
pub trait AudioDevice: Send + Sync {
    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    fn input_channels(&self) -> usize;
    /// Whether the second input channel carries the playback reference.
    fn input_reference(&self) -> bool;

    /// Take one captured frame, if any.
    fn input_data(&self) -> Option<Vec<i16>>;
    /// Queue mono PCM at the output rate for playback.
    fn output_data(&self, pcm: &[i16]);
    fn enable_output(&self, enable: bool);

    fn on_input_ready(&self, callback: ReadyCallback);
    fn on_output_ready(&self, callback: ReadyCallback);

    fn start(&self) -> Result<()>;
}
