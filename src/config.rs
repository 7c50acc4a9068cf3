//! Session configuration
//!
//! Defaults match the production voice endpoint: 16 kHz mono capture in
//! 100 ms frames, 24 kHz playback, 300 ms redial after a completed turn and
//! a 1 s backoff after a connection failure.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when the server signals that its turn is complete.
///
/// The protocol admits two client behaviors and deployed servers differ:
/// some finish one exchange per connection and expect a redial, others keep
/// the connection open and only expect the client to resume sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Close the connection after each turn and dial a fresh one.
    ReconnectPerTurn,
    /// Keep the connection; just re-open the send-gate.
    GateToggle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Streaming endpoint, e.g. `wss://example.com/voice`.
    pub url: String,

    /// Sample rate of outbound microphone audio.
    pub capture_sample_rate: u32,

    /// Sample rate of inbound audio from the server.
    pub playback_sample_rate: u32,

    /// Duration of one outbound audio frame. 100 ms at 16 kHz mono PCM16
    /// is 1600 samples (3200 bytes on the wire).
    pub frame_duration_ms: u32,

    /// Delay before redialing after a completed turn (ReconnectPerTurn only).
    pub turn_reconnect_delay_ms: u64,

    /// Delay before redialing after a connection failure.
    pub failure_backoff_ms: u64,

    /// Maximum buffered playback audio. When the speaker cannot keep up,
    /// the oldest samples are dropped first.
    pub playback_buffer_secs: f32,

    /// Behavior on the server's turn-complete signal.
    pub turn_policy: TurnPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            frame_duration_ms: 100,
            turn_reconnect_delay_ms: 300,
            failure_backoff_ms: 1000,
            playback_buffer_secs: 5.0,
            turn_policy: TurnPolicy::ReconnectPerTurn,
        }
    }
}

impl SessionConfig {
    /// Config for the given endpoint with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Samples per outbound frame at the capture rate.
    pub fn samples_per_frame(&self) -> usize {
        (self.capture_sample_rate * self.frame_duration_ms / 1000) as usize
    }

    pub fn turn_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.turn_reconnect_delay_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    /// Load configuration from a JSON file, falling back to defaults if the
    /// file is missing or malformed. Absent fields take their defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<SessionConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Config: failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Config: failed to read {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}
