//! WebSocket connection lifecycle
//!
//! `establish()` performs one connection attempt with a handshake timeout.
//! On success the stream is split: a writer task drains the outbound
//! channel and a reader task translates inbound messages into session
//! events. Unexpected inbound shapes (ping/pong, odd text) are ignored
//! rather than failing the session.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
};
use uuid::Uuid;

use super::protocol::is_turn_complete;
use super::ConnectionError;
use crate::audio::frame::AudioFrame;
use crate::state_machine::Event;

/// Handshake timeout for one connection attempt.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the outbound channel: a few hundred ms of audio frames.
const OUTBOUND_CAPACITY: usize = 16;

/// How long a graceful close waits for the writer to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outbound traffic accepted by an established connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Raw PCM16 audio, sent as a binary message.
    Audio(AudioFrame),
    /// A JSON control message, sent as text.
    Control(String),
    /// Close the connection; the writer exits after sending the frame.
    Close { code: u16, reason: &'static str },
}

/// One established connection attempt.
///
/// Superseded handles are discarded, never reused; dropping the handle
/// aborts both I/O tasks.
pub struct ConnectionHandle {
    attempt: Uuid,
    outbound: mpsc::Sender<Outbound>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn attempt(&self) -> Uuid {
        self.attempt
    }

    /// Sender for outbound traffic. Cloned into the capture path via the
    /// session's watch cell.
    pub fn sender(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    /// Handle with live I/O tasks replaced by no-ops, for exercising the
    /// session's commit logic without a socket.
    #[cfg(test)]
    pub(crate) fn stub(attempt: Uuid, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            attempt,
            outbound,
            reader_task: tokio::spawn(async {}),
            writer_task: tokio::spawn(async {}),
        }
    }

    /// Gracefully close: ask the writer to send a close frame, give it a
    /// moment to flush, then stop reading.
    pub async fn close(mut self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(Outbound::Close { code, reason }).await;
        if timeout(CLOSE_GRACE, &mut self.writer_task).await.is_err() {
            self.writer_task.abort();
        }
        self.reader_task.abort();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// One connection attempt: resolves to an open handle or an error, never
/// both. Inbound events are delivered to `events` tagged with `attempt`.
pub async fn establish(
    url: &str,
    attempt: Uuid,
    events: mpsc::Sender<Event>,
) -> Result<ConnectionHandle, ConnectionError> {
    log::info!("Connecting to {} (attempt {})", url, attempt);

    let (ws_stream, _response) = timeout(CONNECTION_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::Failed(e.to_string()))?;

    log::info!("WebSocket open (attempt {})", attempt);

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                Outbound::Audio(frame) => write.send(Message::Binary(frame.to_le_bytes())).await,
                Outbound::Control(json) => write.send(Message::Text(json)).await,
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if let Err(e) = result {
                log::warn!("WebSocket send failed: {}", e);
                break;
            }
        }
        log::debug!("Writer task exiting");
    });

    let reader_task = tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Binary(bytes)) => {
                    let frame = AudioFrame::from_le_bytes(&bytes);
                    if frame.is_empty() {
                        log::debug!("Ignoring empty binary message");
                        continue;
                    }
                    if events
                        .send(Event::AudioReceived { attempt, frame })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    if is_turn_complete(&text) {
                        log::debug!("Server signaled turn complete");
                        if events.send(Event::TurnComplete { attempt }).await.is_err() {
                            break;
                        }
                    } else {
                        log::debug!("Ignoring status message: {}", text);
                    }
                }
                Ok(Message::Close(close_frame)) => {
                    let reason = close_frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".to_string());
                    log::info!("WebSocket closed: {}", reason);
                    let _ = events.send(Event::ConnectionLost { attempt, reason }).await;
                    break;
                }
                Ok(_) => {} // ping/pong/raw frames
                Err(e) => {
                    log::warn!("WebSocket error: {}", e);
                    let _ = events
                        .send(Event::ConnectionLost {
                            attempt,
                            reason: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
        log::debug!("Reader task exiting");
    });

    Ok(ConnectionHandle {
        attempt,
        outbound: outbound_tx,
        reader_task,
        writer_task,
    })
}
