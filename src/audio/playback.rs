//! Speaker playback path
//!
//! Inbound frames are resampled to the device rate and pushed into a
//! bounded sample queue; the CPAL output callback drains it, padding with
//! silence when the queue runs dry. The queue is bounded with a
//! drop-oldest policy: if playback cannot keep up, the most recent audio
//! wins. Like capture, the output stream lives on a dedicated thread.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};

use super::frame::AudioFrame;
use super::resample::resample;
use super::AudioError;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded thread-safe queue of mono samples at the device rate.
///
/// `push` never blocks: when the queue is at capacity the oldest samples
/// are evicted to make room.
pub struct PlaybackQueue {
    samples: Mutex<VecDeque<i16>>,
    max_samples: usize,
}

impl PlaybackQueue {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples.min(1 << 20))),
            max_samples: max_samples.max(1),
        }
    }

    /// Enqueue samples, evicting the oldest on overflow.
    /// Returns how many samples were dropped.
    pub fn push(&self, samples: &[i16]) -> usize {
        let mut queue = self.samples.lock().unwrap();
        queue.extend(samples.iter().copied());

        let mut dropped = 0;
        while queue.len() > self.max_samples {
            queue.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Fill an interleaved f32 output buffer, replicating mono samples
    /// across channels and zero-padding once the queue is empty.
    /// Returns how many mono samples were consumed.
    pub fn fill(&self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.max(1);
        let frames_needed = out.len() / channels;

        let mut queue = self.samples.lock().unwrap();
        let available = queue.len().min(frames_needed);

        for i in 0..available {
            // pop_front cannot fail here; len was checked above
            let sample = queue.pop_front().unwrap_or(0);
            let value = sample as f32 / i16::MAX as f32;
            for c in 0..channels {
                out[i * channels + c] = value;
            }
        }

        for value in out.iter_mut().skip(available * channels) {
            *value = 0.0;
        }

        available
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().unwrap().is_empty()
    }
}

struct PlaybackThread {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackThread {
    fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlaybackThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Cheap enqueue-side handle to an open sink: the shared queue plus the
/// rates needed to resample inbound frames. Enqueueing is synchronous, so
/// a caller that enqueues frames in arrival order plays them in arrival
/// order.
pub struct PlaybackHandle {
    queue: Arc<PlaybackQueue>,
    source_rate: u32,
    device_sample_rate: u32,
}

impl PlaybackHandle {
    pub fn new(queue: Arc<PlaybackQueue>, source_rate: u32, device_sample_rate: u32) -> Self {
        Self {
            queue,
            source_rate,
            device_sample_rate,
        }
    }

    /// Enqueue an inbound frame for playback, resampling to the device
    /// rate. Non-blocking; overflow evicts the oldest audio.
    pub fn enqueue(&self, frame: &AudioFrame) {
        let resampled = resample(frame.samples(), self.source_rate, self.device_sample_rate);
        let dropped = self.queue.push(&resampled);
        if dropped > 0 {
            log::debug!("Playback queue full, dropped {} oldest samples", dropped);
        }
    }
}

/// Speaker sink: owns the output device thread and the sample queue.
pub struct PlaybackSink {
    queue: Arc<PlaybackQueue>,
    source_rate: u32,
    device_sample_rate: u32,
    thread: PlaybackThread,
}

impl PlaybackSink {
    /// Open the default output device on a dedicated thread.
    ///
    /// `source_rate` is the rate of inbound frames (24 kHz from the
    /// server); `buffer_secs` bounds the queue in seconds of device-rate
    /// audio. Blocks until the device reports open success or failure.
    pub fn open(source_rate: u32, buffer_secs: f32) -> Result<Self, AudioError> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) =
            std_mpsc::channel::<Result<(u32, Arc<PlaybackQueue>), AudioError>>();

        let thread = std::thread::Builder::new()
            .name("voicelink-playback".to_string())
            .spawn(move || {
                match open_stream(buffer_secs) {
                    Ok((stream, sample_rate, queue)) => {
                        if ready_tx.send(Ok((sample_rate, queue))).is_err() {
                            return;
                        }
                        let _ = stop_rx.recv();
                        drop(stream);
                        log::debug!("Playback thread ended");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok((device_sample_rate, queue))) => Ok(Self {
                queue,
                source_rate,
                device_sample_rate,
                thread: PlaybackThread {
                    stop_tx,
                    thread: Some(thread),
                },
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::StreamCreationFailed(
                "Timed out opening output device".to_string(),
            )),
        }
    }

    /// Enqueue-side handle for the session's playback path.
    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle::new(
            Arc::clone(&self.queue),
            self.source_rate,
            self.device_sample_rate,
        )
    }

    /// Discard buffered audio, stop the stream, and join the thread.
    pub fn close(self) {
        self.queue.clear();
        self.thread.stop();
    }
}

fn open_stream(buffer_secs: f32) -> Result<(Stream, u32, Arc<PlaybackQueue>), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let max_samples = (sample_rate as f32 * buffer_secs).ceil() as usize;
    let queue = Arc::new(PlaybackQueue::new(max_samples));
    let callback_queue = Arc::clone(&queue);

    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback_queue.fill(data, channels);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
    })?;

    Ok((stream, sample_rate, queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_within_capacity_drops_nothing() {
        let queue = PlaybackQueue::new(10);
        assert_eq!(queue.push(&[1, 2, 3]), 0);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let queue = PlaybackQueue::new(4);
        queue.push(&[1, 2, 3, 4]);
        let dropped = queue.push(&[5, 6]);

        assert_eq!(dropped, 2);
        assert_eq!(queue.len(), 4);

        // The oldest samples (1, 2) were evicted; 3 plays next
        let mut out = [0.0f32; 1];
        queue.fill(&mut out, 1);
        assert!((out[0] - 3.0 / i16::MAX as f32).abs() < f32::EPSILON);
    }

    #[test]
    fn fill_pads_with_silence() {
        let queue = PlaybackQueue::new(100);
        queue.push(&[i16::MAX]);

        let mut out = [1.0f32; 4];
        let consumed = queue.fill(&mut out, 1);

        assert_eq!(consumed, 1);
        assert!((out[0] - 1.0).abs() < f32::EPSILON);
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn fill_replicates_mono_across_channels() {
        let queue = PlaybackQueue::new(100);
        queue.push(&[i16::MAX, 0]);

        let mut out = [9.0f32; 4];
        let consumed = queue.fill(&mut out, 2);

        assert_eq!(consumed, 2);
        assert_eq!(out, [1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn handle_enqueue_resamples_to_device_rate() {
        let queue = Arc::new(PlaybackQueue::new(10_000));
        let handle = PlaybackHandle::new(Arc::clone(&queue), 24_000, 48_000);

        handle.enqueue(&AudioFrame::new(vec![0i16; 240]));
        assert_eq!(queue.len(), 480);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = PlaybackQueue::new(100);
        queue.push(&[1, 2, 3]);
        queue.clear();
        assert!(queue.is_empty());
    }
}
