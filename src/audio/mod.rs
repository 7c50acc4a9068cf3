//! Audio capture and playback
//!
//! Microphone input and speaker output both run on dedicated audio threads
//! owning their CPAL streams; the rest of the crate talks to them through
//! channels and a bounded sample queue.

pub mod capture;
pub mod frame;
pub mod playback;
pub mod resample;

pub use capture::{open_input, run_capture_pump, CaptureHandle, CaptureSource};
pub use frame::AudioFrame;
pub use playback::{PlaybackHandle, PlaybackQueue, PlaybackSink};
pub use resample::resample;

/// Errors from opening or running the audio devices.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for AudioError {}
