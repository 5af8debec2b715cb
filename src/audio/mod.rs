//! audio - capture/playback pipeline, codecs and device contracts
//!
//! The device itself is abstract ([`AudioDevice`]); the ALSA binding is
//! behind the `alsa` feature.

#[cfg(feature = "alsa")]
mod alsa_device;
mod device;
mod frontend;
mod opus_codec;
pub mod p3;
mod pipeline;
mod resampler;

#[cfg(feature = "alsa")]
pub use alsa_device::{AlsaAudioDevice, AlsaConfig};
pub use device::AudioDevice;
#[cfg(test)]
pub use device::ReadyCallback;
pub use frontend::{AudioProcessor, WakeWordDetector};
#[cfg(test)]
pub use frontend::{PcmCallback, VadCallback, WakeWordCallback};
#[cfg(test)]
pub use opus_codec::OpusEncoder;
pub use pipeline::{AudioPipeline, mic_channel};
