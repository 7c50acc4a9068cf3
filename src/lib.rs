//! voicelink: half-duplex voice chat over a single WebSocket.
//!
//! One session owns the microphone, the speaker, and the streaming
//! connection. Outbound microphone audio is cut into fixed PCM16 frames
//! and sent as binary messages; inbound binary messages are played back
//! as they arrive. Turn-taking is half-duplex: while the server speaks,
//! the client's send-gate is closed, and after the server signals turn
//! completion the session either redials or re-opens the gate, depending
//! on [`config::TurnPolicy`].
//!
//! All session logic lives in a pure reducer ([`state_machine::reduce`]);
//! the event loop in [`session`] is its single writer and delegates side
//! effects to an [`session::EffectRunner`].

pub mod audio;
pub mod config;
pub mod connection;
pub mod session;
pub mod state_machine;

pub use config::{SessionConfig, TurnPolicy};
pub use session::{EffectRunner, VoiceSession};
pub use state_machine::VoiceState;
