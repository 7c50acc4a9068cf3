//! Wire control messages
//!
//! Binary payloads are raw little-endian PCM16 and never JSON. Text
//! payloads are small control messages: outbound, only a close
//! notification; inbound, server status lines of which only the
//! turn-complete signal matters. The server's status schema is not
//! published, so turn completion is detected by substring rather than by
//! parsing a structure that could change shape underneath us.

use serde::Serialize;

/// Substring marking the end of the server's speaking turn.
pub const TURN_COMPLETE_MARKER: &str = "turn_complete";

/// Control messages sent to the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Best-effort notice that the client is ending the session.
    Close,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Does an inbound status message signal turn completion?
pub fn is_turn_complete(text: &str) -> bool {
    text.contains(TURN_COMPLETE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_message_shape() {
        let json = ControlMessage::Close.to_json().unwrap();
        assert_eq!(json, r#"{"type":"close"}"#);
    }

    #[test]
    fn turn_complete_detection() {
        assert!(is_turn_complete(r#"{"status": "turn_complete"}"#));
        assert!(is_turn_complete("turn_complete"));
        assert!(!is_turn_complete(r#"{"status": "thinking"}"#));
        assert!(!is_turn_complete(""));
    }
}
