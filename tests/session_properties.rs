//! Session-level behavior tests
//!
//! These drive the real event loop with scripted effect runners in place
//! of the devices and the network, checking the observable properties:
//! state transition order, half-duplex gating, reconnect scheduling, and
//! resource balance across start/stop cycles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use voicelink::audio::capture::run_capture_pump;
use voicelink::audio::frame::AudioFrame;
use voicelink::config::SessionConfig;
use voicelink::connection::Outbound;
use voicelink::session::{EffectRunner, StateCallback, VoiceSession};
use voicelink::state_machine::{Effect, Event, VoiceState};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> SessionConfig {
    SessionConfig::new("wss://example.invalid/voice")
}

fn frame() -> AudioFrame {
    AudioFrame::new(vec![0i16; 2400])
}

/// Records every effect it is handed; performs none of them.
struct RecordingRunner {
    effects: Mutex<Vec<Effect>>,
}

impl RecordingRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: Mutex::new(Vec::new()),
        })
    }

    fn count(&self, pred: impl Fn(&Effect) -> bool) -> usize {
        self.effects.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl EffectRunner for RecordingRunner {
    fn spawn(&self, effect: Effect, _tx: mpsc::Sender<Event>) {
        self.effects.lock().unwrap().push(effect);
    }
}

/// Simulates a server that answers every dial, speaks one turn after the
/// first time the send-gate opens, and honors reconnect timers instantly.
struct ScriptedTurnRunner {
    effects: Mutex<Vec<Effect>>,
    last_attempt: Mutex<Option<Uuid>>,
    turn_done: AtomicBool,
}

impl ScriptedTurnRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: Mutex::new(Vec::new()),
            last_attempt: Mutex::new(None),
            turn_done: AtomicBool::new(false),
        })
    }
}

impl EffectRunner for ScriptedTurnRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        self.effects.lock().unwrap().push(effect.clone());
        match effect {
            Effect::Connect { attempt } => {
                *self.last_attempt.lock().unwrap() = Some(attempt);
                let _ = tx.try_send(Event::Opened { attempt });
            }
            Effect::ScheduleReconnect { attempt, .. } => {
                // No waiting in tests; the timer fires immediately
                let _ = tx.try_send(Event::ReconnectDue { attempt });
            }
            Effect::EnableSend => {
                if !self.turn_done.swap(true, Ordering::SeqCst) {
                    let attempt = self.last_attempt.lock().unwrap().unwrap();
                    let _ = tx.try_send(Event::AudioReceived {
                        attempt,
                        frame: frame(),
                    });
                    let _ = tx.try_send(Event::TurnComplete { attempt });
                }
            }
            _ => {}
        }
    }
}

/// Collects the states published to the presentation layer.
fn state_recorder() -> (StateCallback, Arc<Mutex<Vec<VoiceState>>>) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let callback: StateCallback = Arc::new(move |s| sink.lock().unwrap().push(s));
    (callback, states)
}

async fn wait_for_states(states: &Mutex<Vec<VoiceState>>, at_least: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if states.lock().unwrap().len() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for state transitions");
}

#[tokio::test]
async fn full_turn_walks_through_all_four_states() {
    let runner = ScriptedTurnRunner::new();
    let (callback, states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    session.start().await;
    wait_for_states(&states, 5).await;
    session.close().await;

    // connecting, listening, server speaks, redial, listening again
    let seen = states.lock().unwrap().clone();
    assert_eq!(
        &seen[..5],
        &[
            VoiceState::Connecting,
            VoiceState::Listening,
            VoiceState::Speaking,
            VoiceState::Connecting,
            VoiceState::Listening,
        ]
    );

    let effects = runner.effects.lock().unwrap().clone();

    // The turn closed the connection gracefully and redialed after 300 ms
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::CloseConnection { code: 1000, .. })));
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::ScheduleReconnect { delay, .. } if *delay == Duration::from_millis(300)
    )));

    // The inbound frame reached playback
    assert!(effects.iter().any(|e| matches!(e, Effect::PlayAudio { .. })));
}

#[tokio::test]
async fn gate_closes_before_playback_on_server_turn() {
    let runner = ScriptedTurnRunner::new();
    let (callback, states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    session.start().await;
    wait_for_states(&states, 3).await;
    session.close().await;

    let effects = runner.effects.lock().unwrap().clone();
    let disable = effects
        .iter()
        .position(|e| matches!(e, Effect::DisableSend))
        .expect("send gate never closed");
    let play = effects
        .iter()
        .position(|e| matches!(e, Effect::PlayAudio { .. }))
        .expect("frame never played");
    assert!(disable < play, "gate must close before audio plays");
}

#[tokio::test]
async fn start_stop_cycles_balance_acquisition_and_teardown() {
    let runner = RecordingRunner::new();
    let (callback, _states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    for _ in 0..100 {
        session.start().await;
        session.stop().await;
    }
    session.close().await;

    let captures = runner.count(|e| matches!(e, Effect::StartCapture));
    let playbacks = runner.count(|e| matches!(e, Effect::StartPlayback));
    let teardowns = runner.count(|e| matches!(e, Effect::Teardown));

    assert_eq!(captures, 100);
    assert_eq!(playbacks, 100);
    assert_eq!(teardowns, 100);
}

#[tokio::test]
async fn start_is_idempotent_at_the_loop_level() {
    let runner = RecordingRunner::new();
    let (callback, states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    session.start().await;
    session.start().await;
    session.start().await;
    wait_for_states(&states, 1).await;
    session.close().await;

    // One dial, one device acquisition, despite three starts
    assert_eq!(runner.count(|e| matches!(e, Effect::Connect { .. })), 1);
    assert_eq!(runner.count(|e| matches!(e, Effect::StartCapture)), 1);
}

#[tokio::test]
async fn stop_while_idle_publishes_nothing() {
    let runner = RecordingRunner::new();
    let (callback, states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    session.stop().await;
    session.close().await;

    assert!(states.lock().unwrap().is_empty());
    assert!(runner.effects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn published_states_never_repeat_consecutively() {
    let runner = ScriptedTurnRunner::new();
    let (callback, states) = state_recorder();
    let session =
        VoiceSession::spawn_with_runner(test_config(), Arc::clone(&runner) as Arc<dyn EffectRunner>, callback);

    session.start().await;
    wait_for_states(&states, 5).await;
    session.stop().await;
    session.close().await;

    let seen = states.lock().unwrap().clone();
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1], "duplicate state published: {:?}", seen);
    }
}

#[tokio::test]
async fn capture_pump_discards_frames_while_gate_closed() {
    let config = test_config();
    let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(8);
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(8);
    let (_watch_tx, watch_rx) = watch::channel(Some(out_tx));
    let gate = Arc::new(AtomicBool::new(false));

    let pump = tokio::spawn(run_capture_pump(
        sample_rx,
        config.capture_sample_rate,
        config.clone(),
        Arc::clone(&gate),
        watch_rx,
        CancellationToken::new(),
    ));

    // Two full frames' worth of samples, gate closed
    sample_tx
        .send(vec![0i16; config.samples_per_frame() * 2])
        .await
        .unwrap();
    drop(sample_tx);
    pump.await.unwrap();

    assert!(out_rx.try_recv().is_err(), "frame leaked past closed gate");
}

#[tokio::test]
async fn capture_pump_forwards_full_frames_while_gate_open() {
    let config = test_config();
    let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(8);
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(8);
    let (_watch_tx, watch_rx) = watch::channel(Some(out_tx));
    let gate = Arc::new(AtomicBool::new(true));

    let pump = tokio::spawn(run_capture_pump(
        sample_rx,
        config.capture_sample_rate,
        config.clone(),
        Arc::clone(&gate),
        watch_rx,
        CancellationToken::new(),
    ));

    let per_frame = config.samples_per_frame();
    // One and a half frames: exactly one full frame should go out
    sample_tx.send(vec![7i16; per_frame + per_frame / 2]).await.unwrap();
    drop(sample_tx);
    pump.await.unwrap();

    match out_rx.try_recv() {
        Ok(Outbound::Audio(frame)) => {
            assert_eq!(frame.len(), per_frame);
            assert_eq!(frame.to_le_bytes().len(), per_frame * 2);
        }
        other => panic!("expected one audio frame, got {:?}", other),
    }
    assert!(out_rx.try_recv().is_err(), "partial frame must not be sent");
}

#[tokio::test]
async fn capture_pump_drops_frames_without_a_connection() {
    let config = test_config();
    let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(8);
    let (watch_tx, watch_rx) = watch::channel::<Option<mpsc::Sender<Outbound>>>(None);
    let gate = Arc::new(AtomicBool::new(true));

    let pump = tokio::spawn(run_capture_pump(
        sample_rx,
        config.capture_sample_rate,
        config.clone(),
        Arc::clone(&gate),
        watch_rx,
        CancellationToken::new(),
    ));

    // Mid-reconnect there is no sender; the pump must not stall
    sample_tx
        .send(vec![0i16; config.samples_per_frame()])
        .await
        .unwrap();
    drop(sample_tx);

    tokio::time::timeout(WAIT, pump)
        .await
        .expect("pump stalled with no connection")
        .unwrap();
    drop(watch_tx);
}

#[tokio::test]
async fn capture_pump_stops_on_cancellation() {
    let config = test_config();
    let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(8);
    let (out_tx, _out_rx) = mpsc::channel::<Outbound>(8);
    let (_watch_tx, watch_rx) = watch::channel(Some(out_tx));
    let cancel = CancellationToken::new();

    let pump = tokio::spawn(run_capture_pump(
        sample_rx,
        config.capture_sample_rate,
        config.clone(),
        Arc::new(AtomicBool::new(true)),
        watch_rx,
        cancel.clone(),
    ));

    cancel.cancel();
    tokio::time::timeout(WAIT, pump)
        .await
        .expect("pump did not stop on cancel")
        .unwrap();
    drop(sample_tx);
}
