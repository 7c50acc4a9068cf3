//! Voice session state machine
//!
//! This module implements the session logic using a single-writer pattern.
//! All transitions go through the `reduce()` function, which returns a new
//! state and a list of effects to execute; it owns no I/O and is fully
//! deterministic given the event stream.
//!
//! Connection events carry the attempt id of the connection that produced
//! them; events tagged with a superseded id are dropped, which is what
//! keeps at most one connection attempt outstanding across reconnects.

use std::time::Duration;
use uuid::Uuid;

use crate::audio::frame::AudioFrame;
use crate::config::{SessionConfig, TurnPolicy};

/// Close code for a deliberate end of connection.
const CLOSE_NORMAL: u16 = 1000;

/// The coarse state visible to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Connecting,
    Listening,
    Speaking,
}

impl VoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceState::Idle => "idle",
            VoiceState::Connecting => "connecting",
            VoiceState::Listening => "listening",
            VoiceState::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal session state. This is the authoritative state - all
/// transitions go through the reducer. `attempt` identifies the connection
/// attempt the state belongs to: scheduled or dialing in `Connecting`,
/// live in `Listening`/`Speaking`.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Connecting { attempt: Uuid },
    Listening { attempt: Uuid },
    Speaking { attempt: Uuid },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

impl State {
    pub fn voice_state(&self) -> VoiceState {
        match self {
            State::Idle => VoiceState::Idle,
            State::Connecting { .. } => VoiceState::Connecting,
            State::Listening { .. } => VoiceState::Listening,
            State::Speaking { .. } => VoiceState::Speaking,
        }
    }
}

/// Events that trigger transitions: user intent from the presentation
/// layer, inbound traffic from the connection reader, timer expiry, and
/// device failures.
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Stop,
    /// Ends the event loop itself; handled at the loop edge, not here.
    Shutdown,

    Opened { attempt: Uuid },
    ConnectFailed { attempt: Uuid, err: String },
    ConnectionLost { attempt: Uuid, reason: String },
    AudioReceived { attempt: Uuid, frame: AudioFrame },
    TurnComplete { attempt: Uuid },
    /// The scheduled reconnect delay elapsed.
    ReconnectDue { attempt: Uuid },

    CaptureFailed { err: String },
    PlaybackFailed { err: String },
}

/// Effects to be executed after a transition. The effect runner performs
/// these; `EmitState` is handled by the event loop itself.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Open the speaker and keep its queue draining.
    StartPlayback,
    /// Open the microphone and start the capture pump.
    StartCapture,
    /// Dial the connection attempt with this id.
    Connect { attempt: Uuid },
    /// Fire `ReconnectDue { attempt }` after `delay`.
    ScheduleReconnect { attempt: Uuid, delay: Duration },
    /// Open the send-gate: captured audio flows to the connection.
    EnableSend,
    /// Close the send-gate: captured audio is discarded.
    DisableSend,
    /// Enqueue an inbound frame for playback.
    PlayAudio { frame: AudioFrame },
    /// Gracefully close the current connection.
    CloseConnection { code: u16, reason: &'static str },
    /// Release every session resource, each step individually guarded.
    Teardown,
    /// Publish the public state to the presentation layer.
    EmitState,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Drop events tagged with a stale attempt id
/// - Emit EmitState whenever the public state may have changed
pub fn reduce(state: &State, event: Event, config: &SessionConfig) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current: Option<Uuid> = match state {
        Idle => None,
        Connecting { attempt } | Listening { attempt } | Speaking { attempt } => Some(*attempt),
    };
    let is_stale = |id: Uuid| current != Some(id);

    match (state, event) {
        // -------- Start / Stop --------
        (Idle, Start) => {
            let attempt = Uuid::new_v4();
            (
                Connecting { attempt },
                vec![StartPlayback, StartCapture, Connect { attempt }, EmitState],
            )
        }
        // Already running: start is idempotent
        (_, Start) => (state.clone(), vec![]),

        (Idle, Stop) => (Idle, vec![]),
        (_, Stop) => (Idle, vec![DisableSend, Teardown, EmitState]),

        // -------- Device failures (fatal, not retried) --------
        (Idle, CaptureFailed { .. }) | (Idle, PlaybackFailed { .. }) => (Idle, vec![]),
        (_, CaptureFailed { err }) => {
            log::error!("Capture failed, ending session: {}", err);
            (Idle, vec![DisableSend, Teardown, EmitState])
        }
        (_, PlaybackFailed { err }) => {
            log::error!("Playback failed, ending session: {}", err);
            (Idle, vec![DisableSend, Teardown, EmitState])
        }

        // -------- Connecting --------
        (Connecting { attempt }, ReconnectDue { attempt: id }) if *attempt == id => {
            (Connecting { attempt: id }, vec![Connect { attempt: id }])
        }
        (Connecting { attempt }, Opened { attempt: id }) if *attempt == id => {
            (Listening { attempt: id }, vec![EnableSend, EmitState])
        }
        (Connecting { attempt }, ConnectFailed { attempt: id, err }) if *attempt == id => {
            log::warn!("Connection attempt failed: {}", err);
            let next = Uuid::new_v4();
            (
                Connecting { attempt: next },
                vec![
                    ScheduleReconnect {
                        attempt: next,
                        delay: config.failure_backoff(),
                    },
                    EmitState,
                ],
            )
        }

        // -------- Listening / Speaking --------
        (Listening { attempt }, AudioReceived { attempt: id, frame }) if *attempt == id => (
            Speaking { attempt: id },
            // The remote side took the turn; mic audio must stop flowing
            vec![DisableSend, PlayAudio { frame }, EmitState],
        ),
        (Speaking { attempt }, AudioReceived { attempt: id, frame }) if *attempt == id => {
            (Speaking { attempt: id }, vec![PlayAudio { frame }])
        }

        (Listening { attempt }, TurnComplete { attempt: id })
        | (Speaking { attempt }, TurnComplete { attempt: id })
            if *attempt == id =>
        {
            match config.turn_policy {
                // The server serves one exchange per connection and
                // expects a redial for the next turn
                TurnPolicy::ReconnectPerTurn => {
                    let next = Uuid::new_v4();
                    (
                        Connecting { attempt: next },
                        vec![
                            DisableSend,
                            CloseConnection {
                                code: CLOSE_NORMAL,
                                reason: "turn done",
                            },
                            ScheduleReconnect {
                                attempt: next,
                                delay: config.turn_reconnect_delay(),
                            },
                            EmitState,
                        ],
                    )
                }
                TurnPolicy::GateToggle => {
                    (Listening { attempt: id }, vec![EnableSend, EmitState])
                }
            }
        }

        (Listening { attempt }, ConnectionLost { attempt: id, reason })
        | (Speaking { attempt }, ConnectionLost { attempt: id, reason })
            if *attempt == id =>
        {
            log::warn!("Connection lost: {}", reason);
            let next = Uuid::new_v4();
            (
                Connecting { attempt: next },
                vec![
                    DisableSend,
                    ScheduleReconnect {
                        attempt: next,
                        delay: config.failure_backoff(),
                    },
                    EmitState,
                ],
            )
        }

        // -------- Stale connection events: drop silently --------
        (_, Opened { attempt }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, ConnectFailed { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, ConnectionLost { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, AudioReceived { attempt, .. }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, TurnComplete { attempt }) if is_stale(attempt) => (state.clone(), vec![]),
        (_, ReconnectDue { attempt }) if is_stale(attempt) => (state.clone(), vec![]),

        // -------- Anything else: no transition --------
        _ => (state.clone(), vec![]),
    }
}
