//! Microphone capture path
//!
//! The CPAL input stream lives on a dedicated thread (CPAL streams are not
//! `Send`); its callback downmixes to mono i16 and hands batches over a
//! channel to the async capture pump. The pump resamples to the outbound
//! rate, accumulates fixed 100 ms frames, and forwards them to the current
//! connection — but only while the send-gate is open. The gate and the
//! connection reference are the only state shared with the session loop,
//! and neither is read under a blocking lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::frame::AudioFrame;
use super::resample::resample;
use super::AudioError;
use crate::config::SessionConfig;
use crate::connection::Outbound;

/// Capacity of the device-callback-to-pump channel. The callback never
/// blocks; if the pump falls behind, batches are dropped at the device.
const CAPTURE_CHANNEL_CAPACITY: usize = 32;

/// How long to wait for the capture thread to report the device open result.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the dedicated thread holding the CPAL input stream.
pub struct CaptureThread {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureThread {
    /// Stop the stream and join the thread.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// An opened microphone: the device thread plus the raw sample channel.
pub struct CaptureSource {
    thread: CaptureThread,
    device_sample_rate: u32,
    samples: mpsc::Receiver<Vec<i16>>,
}

impl CaptureSource {
    pub fn split(self) -> (CaptureThread, u32, mpsc::Receiver<Vec<i16>>) {
        (self.thread, self.device_sample_rate, self.samples)
    }
}

/// Handle used to tear down the full capture path (device thread + pump).
pub struct CaptureHandle {
    thread: CaptureThread,
    cancel: CancellationToken,
}

impl CaptureHandle {
    pub fn new(thread: CaptureThread, cancel: CancellationToken) -> Self {
        Self { thread, cancel }
    }

    /// Stop the pump and the device thread. Blocks until the thread joins.
    pub fn stop(self) {
        self.cancel.cancel();
        self.thread.stop();
    }
}

/// Open the default input device on a dedicated thread.
///
/// Blocks until the device reports open success or failure. Acquisition
/// failure is fatal for the session and is not retried.
pub fn open_input() -> Result<CaptureSource, AudioError> {
    let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(CAPTURE_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();

    let thread = std::thread::Builder::new()
        .name("voicelink-capture".to_string())
        .spawn(move || {
            match open_stream(sample_tx) {
                Ok((stream, sample_rate)) => {
                    if ready_tx.send(Ok(sample_rate)).is_err() {
                        return;
                    }
                    // Hold the stream on this thread until stop is signaled.
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("Capture thread ended");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    match ready_rx.recv_timeout(OPEN_TIMEOUT) {
        Ok(Ok(device_sample_rate)) => Ok(CaptureSource {
            thread: CaptureThread {
                stop_tx,
                thread: Some(thread),
            },
            device_sample_rate,
            samples: sample_rx,
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(AudioError::StreamCreationFailed(
            "Timed out opening input device".to_string(),
        )),
    }
}

fn open_stream(sample_tx: mpsc::Sender<Vec<i16>>) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, channels, sample_tx),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, channels, sample_tx),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, channels, sample_tx),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
    })?;

    Ok((stream, sample_rate))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    sample_tx: mpsc::Sender<Vec<i16>>,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix_to_mono(data, channels);
                // Never block the device callback; drop the batch if the
                // pump is behind.
                if sample_tx.try_send(mono).is_err() {
                    log::debug!("Capture channel full, dropping batch");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Average interleaved channels down to mono i16.
fn downmix_to_mono<T: cpal::Sample<Float = f32>>(data: &[T], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.iter().map(|&s| sample_to_i16(s)).collect();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| sample_to_i16(s) as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Convert any sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Bridge raw device batches to the connection: resample to the outbound
/// rate, cut fixed-size frames, and forward each frame only if the
/// send-gate is open and a connection is currently available.
///
/// The connection sender is read through the watch cell at point of use,
/// never cached across an await, so a reconnect swaps it atomically from
/// this loop's perspective. Runs until cancelled or the sample channel
/// closes.
pub async fn run_capture_pump(
    mut samples: mpsc::Receiver<Vec<i16>>,
    source_rate: u32,
    config: SessionConfig,
    gate: Arc<AtomicBool>,
    conn: watch::Receiver<Option<mpsc::Sender<Outbound>>>,
    cancel: CancellationToken,
) {
    let target_rate = config.capture_sample_rate;
    let samples_per_frame = config.samples_per_frame();
    let mut buffer: Vec<i16> = Vec::with_capacity(samples_per_frame * 2);
    let mut frames_sent: u64 = 0;

    log::info!(
        "Capture pump: {} Hz -> {} Hz, {} ms frames ({} samples)",
        source_rate,
        target_rate,
        config.frame_duration_ms,
        samples_per_frame
    );

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = samples.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        buffer.extend(resample(&batch, source_rate, target_rate));

        while buffer.len() >= samples_per_frame {
            let chunk: Vec<i16> = buffer.drain(..samples_per_frame).collect();

            // Half-duplex: discard mic audio while the gate is closed.
            if !gate.load(Ordering::SeqCst) {
                continue;
            }

            let sender = conn.borrow().clone();
            match sender {
                Some(tx) => {
                    if tx.try_send(Outbound::Audio(AudioFrame::new(chunk))).is_ok() {
                        frames_sent += 1;
                        if frames_sent % 50 == 0 {
                            log::debug!("Capture pump: {} frames sent", frames_sent);
                        }
                    } else {
                        log::debug!("Capture pump: outbound channel unavailable, dropping frame");
                    }
                }
                // Mid-reconnect there is no connection; the frame is dropped.
                None => {}
            }
        }
    }

    log::debug!("Capture pump: exiting ({} frames sent)", frames_sent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn test_downmix_stereo() {
        // Interleaved stereo pairs are averaged
        let data = [0.0f32, 1.0, -1.0, -1.0];
        let mono = downmix_to_mono(&data, 2);
        assert_eq!(mono, vec![i16::MAX / 2, -i16::MAX]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let data = [0.0f32, 1.0, -1.0];
        assert_eq!(downmix_to_mono(&data, 1), vec![0, i16::MAX, -i16::MAX]);
    }
}
