//! Session event loop and effect runner
//!
//! This module wires the pure state machine to the real world. The loop is
//! the single writer of session state: it consumes events from one channel,
//! runs the reducer, and hands the resulting effects to an `EffectRunner`.
//! State change notifications are deduplicated here so the presentation
//! layer only hears actual transitions.
//!
//! `LiveEffectRunner` executes effects against the real devices and the
//! real connection. It shares exactly two things with the capture path: the
//! send-gate atomic and a watch cell holding the current connection's
//! outbound sender. Inbound frames are enqueued inline, in effect order,
//! because the playback queue itself is non-blocking. Dial results commit
//! through a guarded slot: a connection that resolves after its attempt was
//! superseded is closed instead of installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::capture::{open_input, run_capture_pump, CaptureHandle};
use crate::audio::playback::{PlaybackHandle, PlaybackSink};
use crate::config::SessionConfig;
use crate::connection::protocol::ControlMessage;
use crate::connection::{establish, ConnectionHandle, Outbound};
use crate::state_machine::{reduce, Effect, Event, State, VoiceState};

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// Close code when the whole session ends.
const CLOSE_NORMAL: u16 = 1000;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Callback invoked on each public state transition.
pub type StateCallback = Arc<dyn Fn(VoiceState) + Send + Sync>;

/// Run the session event loop until `Event::Shutdown` arrives or every
/// sender is dropped. `tx` is handed to the runner so effects can report
/// back as events.
pub async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    config: SessionConfig,
    on_state: StateCallback,
) {
    let mut state = State::default();
    let mut published = VoiceState::Idle;

    while let Some(event) = rx.recv().await {
        if matches!(event, Event::Shutdown) {
            break;
        }

        let (next_state, effects) = reduce(&state, event, &config);
        state = next_state;

        for effect in effects {
            match effect {
                Effect::EmitState => {
                    let voice_state = state.voice_state();
                    if voice_state != published {
                        log::info!("Session state: {} -> {}", published, voice_state);
                        published = voice_state;
                        on_state(voice_state);
                    }
                }
                other => runner.spawn(other, tx.clone()),
            }
        }
    }

    log::debug!("Session loop exiting");
}

/// The connection the session currently owns, plus the attempt id a
/// resolving dial must still match to be allowed in. `expected` is set
/// when a dial is issued and cleared on close and teardown, so a dial
/// that resolves late finds the id gone and never installs itself.
#[derive(Default)]
struct ConnectionSlot {
    expected: Option<Uuid>,
    handle: Option<ConnectionHandle>,
}

/// Install a resolved dial if its attempt is still the expected one.
/// Returns the handle back when the attempt was superseded, so the caller
/// can close it instead of leaking an open socket.
fn commit_dial(
    slot: &Mutex<ConnectionSlot>,
    conn_tx: &watch::Sender<Option<mpsc::Sender<Outbound>>>,
    handle: ConnectionHandle,
) -> Result<(), ConnectionHandle> {
    let mut slot = slot.lock().unwrap();
    if slot.expected != Some(handle.attempt()) {
        return Err(handle);
    }
    conn_tx.send_replace(Some(handle.sender()));
    slot.handle = Some(handle);
    Ok(())
}

/// Effect runner backed by the real microphone, speaker, and WebSocket.
pub struct LiveEffectRunner {
    config: SessionConfig,
    send_gate: Arc<AtomicBool>,
    conn_tx: watch::Sender<Option<mpsc::Sender<Outbound>>>,
    connection: Arc<Mutex<ConnectionSlot>>,
    capture: Arc<AsyncMutex<Option<CaptureHandle>>>,
    playback: Arc<AsyncMutex<Option<PlaybackSink>>>,
    playback_route: Arc<Mutex<Option<PlaybackHandle>>>,
}

impl LiveEffectRunner {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (conn_tx, _conn_rx) = watch::channel(None);
        Arc::new(Self {
            config,
            send_gate: Arc::new(AtomicBool::new(false)),
            conn_tx,
            connection: Arc::new(Mutex::new(ConnectionSlot::default())),
            capture: Arc::new(AsyncMutex::new(None)),
            playback: Arc::new(AsyncMutex::new(None)),
            playback_route: Arc::new(Mutex::new(None)),
        })
    }
}

impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            // Gate flips are synchronous; the capture pump reads the atomic
            // on its next frame boundary.
            Effect::EnableSend => {
                self.send_gate.store(true, Ordering::SeqCst);
                log::debug!("Send gate opened");
            }
            Effect::DisableSend => {
                self.send_gate.store(false, Ordering::SeqCst);
                log::debug!("Send gate closed");
            }

            // Enqueued inline so frames keep their arrival order; a frame
            // arriving before the device finished opening is dropped.
            Effect::PlayAudio { frame } => match self.playback_route.lock().unwrap().as_ref() {
                Some(route) => route.enqueue(&frame),
                None => log::debug!("Playback not ready, dropping frame"),
            },

            Effect::Connect { attempt } => {
                self.connection.lock().unwrap().expected = Some(attempt);
                let url = self.config.url.clone();
                let conn_tx = self.conn_tx.clone();
                let connection = Arc::clone(&self.connection);
                tokio::spawn(async move {
                    match establish(&url, attempt, tx.clone()).await {
                        Ok(handle) => match commit_dial(&connection, &conn_tx, handle) {
                            Ok(()) => {
                                let _ = tx.send(Event::Opened { attempt }).await;
                            }
                            Err(stale) => {
                                log::debug!("Dial resolved after being superseded, closing");
                                stale.close(CLOSE_NORMAL, "superseded").await;
                            }
                        },
                        Err(e) => {
                            let _ = tx
                                .send(Event::ConnectFailed {
                                    attempt,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::ScheduleReconnect { attempt, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::ReconnectDue { attempt }).await;
                });
            }

            Effect::StartCapture => {
                let config = self.config.clone();
                let gate = Arc::clone(&self.send_gate);
                let conn_rx = self.conn_tx.subscribe();
                let capture = Arc::clone(&self.capture);
                tokio::spawn(async move {
                    // Device open blocks on the audio thread handshake
                    match tokio::task::spawn_blocking(open_input).await {
                        Ok(Ok(source)) => {
                            let (thread, device_rate, samples) = source.split();
                            let cancel = CancellationToken::new();
                            tokio::spawn(run_capture_pump(
                                samples,
                                device_rate,
                                config,
                                gate,
                                conn_rx,
                                cancel.clone(),
                            ));
                            *capture.lock().await = Some(CaptureHandle::new(thread, cancel));
                        }
                        Ok(Err(e)) => {
                            let _ = tx
                                .send(Event::CaptureFailed { err: e.to_string() })
                                .await;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Event::CaptureFailed { err: e.to_string() })
                                .await;
                        }
                    }
                });
            }

            Effect::StartPlayback => {
                let source_rate = self.config.playback_sample_rate;
                let buffer_secs = self.config.playback_buffer_secs;
                let playback = Arc::clone(&self.playback);
                let route = Arc::clone(&self.playback_route);
                tokio::spawn(async move {
                    let opened = tokio::task::spawn_blocking(move || {
                        PlaybackSink::open(source_rate, buffer_secs)
                    })
                    .await;
                    match opened {
                        Ok(Ok(sink)) => {
                            *route.lock().unwrap() = Some(sink.handle());
                            *playback.lock().await = Some(sink);
                        }
                        Ok(Err(e)) => {
                            let _ = tx
                                .send(Event::PlaybackFailed { err: e.to_string() })
                                .await;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Event::PlaybackFailed { err: e.to_string() })
                                .await;
                        }
                    }
                });
            }

            Effect::CloseConnection { code, reason } => {
                self.conn_tx.send_replace(None);
                let taken = {
                    let mut slot = self.connection.lock().unwrap();
                    slot.expected = None;
                    slot.handle.take()
                };
                if let Some(handle) = taken {
                    tokio::spawn(async move {
                        handle.close(code, reason).await;
                    });
                }
            }

            Effect::Teardown => {
                self.conn_tx.send_replace(None);
                self.playback_route.lock().unwrap().take();
                let taken = {
                    let mut slot = self.connection.lock().unwrap();
                    slot.expected = None;
                    slot.handle.take()
                };
                let capture = Arc::clone(&self.capture);
                let playback = Arc::clone(&self.playback);
                tokio::spawn(async move {
                    // Each step is independently guarded; a failed or absent
                    // resource never blocks releasing the others.
                    if let Some(handle) = taken {
                        if let Ok(json) = ControlMessage::Close.to_json() {
                            let _ = handle.sender().send(Outbound::Control(json)).await;
                        }
                        handle.close(CLOSE_NORMAL, "session ended").await;
                    }

                    if let Some(capture) = capture.lock().await.take() {
                        let _ = tokio::task::spawn_blocking(move || capture.stop()).await;
                    }

                    if let Some(sink) = playback.lock().await.take() {
                        let _ = tokio::task::spawn_blocking(move || sink.close()).await;
                    }

                    log::info!("Session resources released");
                });
            }

            // Handled by the event loop
            Effect::EmitState => {}
        }
    }
}

/// A running voice session: an owned event loop plus its command channel.
pub struct VoiceSession {
    events: mpsc::Sender<Event>,
    task: tokio::task::JoinHandle<()>,
}

impl VoiceSession {
    /// Spawn a session against the real devices and connection.
    pub fn spawn(
        config: SessionConfig,
        on_state: impl Fn(VoiceState) + Send + Sync + 'static,
    ) -> Self {
        let runner = LiveEffectRunner::new(config.clone());
        Self::spawn_with_runner(config, runner, Arc::new(on_state))
    }

    /// Spawn a session with a custom effect runner.
    pub fn spawn_with_runner(
        config: SessionConfig,
        runner: Arc<dyn EffectRunner>,
        on_state: StateCallback,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let loop_tx = tx.clone();
        let task = tokio::spawn(run_session_loop(rx, loop_tx, runner, config, on_state));
        Self { events: tx, task }
    }

    /// Request a session start. Idempotent while running.
    pub async fn start(&self) {
        let _ = self.events.send(Event::Start).await;
    }

    /// Request a session stop. Resources are released asynchronously.
    pub async fn stop(&self) {
        let _ = self.events.send(Event::Stop).await;
    }

    /// Stop the session and end the event loop.
    pub async fn close(self) {
        let _ = self.events.send(Event::Stop).await;
        let _ = self.events.send(Event::Shutdown).await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use crate::audio::playback::PlaybackQueue;

    fn runner() -> Arc<LiveEffectRunner> {
        LiveEffectRunner::new(SessionConfig::new("wss://example.invalid/voice"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn play_audio_preserves_frame_arrival_order() {
        let runner = runner();
        let queue = Arc::new(PlaybackQueue::new(100_000));
        *runner.playback_route.lock().unwrap() =
            Some(PlaybackHandle::new(Arc::clone(&queue), 24_000, 24_000));

        let (tx, _rx) = mpsc::channel(8);
        for i in 0..200i16 {
            runner.spawn(
                Effect::PlayAudio {
                    frame: AudioFrame::new(vec![i]),
                },
                tx.clone(),
            );
        }

        let mut out = vec![0.0f32; 200];
        assert_eq!(queue.fill(&mut out, 1), 200);

        let played: Vec<i16> = out
            .iter()
            .map(|v| (v * i16::MAX as f32).round() as i16)
            .collect();
        let expected: Vec<i16> = (0..200).collect();
        assert_eq!(played, expected, "frames must play in arrival order");
    }

    #[tokio::test]
    async fn play_audio_before_device_open_drops_the_frame() {
        let runner = runner();
        let (tx, _rx) = mpsc::channel(8);

        runner.spawn(
            Effect::PlayAudio {
                frame: AudioFrame::new(vec![1, 2, 3]),
            },
            tx,
        );

        assert!(runner.playback_route.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn dial_resolving_after_teardown_is_rejected() {
        let runner = runner();
        let (out_tx, _out_rx) = mpsc::channel(4);
        let attempt = Uuid::new_v4();

        // A dial was issued, then the session stopped before it resolved
        runner.connection.lock().unwrap().expected = Some(attempt);
        runner.connection.lock().unwrap().expected = None;

        let late = ConnectionHandle::stub(attempt, out_tx);
        let rejected = commit_dial(&runner.connection, &runner.conn_tx, late);

        assert!(rejected.is_err(), "superseded dial must not install itself");
        assert!(runner.conn_tx.borrow().is_none());
        assert!(runner.connection.lock().unwrap().handle.is_none());
    }

    #[tokio::test]
    async fn dial_for_the_current_attempt_commits() {
        let runner = runner();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        let old_attempt = Uuid::new_v4();
        let new_attempt = Uuid::new_v4();

        // stop() then start(): the session is now dialing a fresh attempt
        runner.connection.lock().unwrap().expected = Some(new_attempt);

        // The old session's dial resolves late and must not win
        let stale = ConnectionHandle::stub(old_attempt, old_tx);
        assert!(commit_dial(&runner.connection, &runner.conn_tx, stale).is_err());
        assert!(runner.conn_tx.borrow().is_none());

        // The current dial installs normally
        let live = ConnectionHandle::stub(new_attempt, new_tx);
        assert!(commit_dial(&runner.connection, &runner.conn_tx, live).is_ok());
        assert!(runner.conn_tx.borrow().is_some());
        assert!(runner.connection.lock().unwrap().handle.is_some());
    }

    #[tokio::test]
    async fn connect_effect_marks_the_dialing_attempt_expected() {
        let runner = runner();
        let (tx, _rx) = mpsc::channel(8);
        let attempt = Uuid::new_v4();

        runner.spawn(Effect::Connect { attempt }, tx);

        assert_eq!(runner.connection.lock().unwrap().expected, Some(attempt));
    }

    #[tokio::test]
    async fn teardown_clears_the_expected_attempt_and_sender() {
        let runner = runner();
        let (tx, _rx) = mpsc::channel(8);
        runner.connection.lock().unwrap().expected = Some(Uuid::new_v4());

        runner.spawn(Effect::Teardown, tx);

        assert!(runner.connection.lock().unwrap().expected.is_none());
        assert!(runner.conn_tx.borrow().is_none());
    }
}
