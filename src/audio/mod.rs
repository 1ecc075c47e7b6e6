//! Audio capture sources and playback outputs.

#[cfg(feature = "cpal-audio")]
pub mod capture;
#[cfg(feature = "cpal-audio")]
pub mod device;
pub mod playback;
pub mod recorder;
#[cfg(feature = "cpal-audio")]
pub mod speaker;
pub mod vad;
pub mod wav;
