//! Fixed-size PCM audio frames
//!
//! A frame is an immutable buffer of 16-bit signed mono samples. On the
//! wire both directions carry raw little-endian PCM16 with no framing
//! header; the frame boundary is the WebSocket message boundary.

/// An immutable buffer of mono PCM16 samples.
///
/// Once a frame is handed to the playback queue or the connection, the
/// producer never touches it again.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as raw little-endian PCM16 for the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Decode from raw little-endian PCM16. A trailing odd byte is dropped.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AudioFrame({} samples)", self.samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encoding_is_little_endian() {
        let frame = AudioFrame::new(vec![0x0102, -2]);
        assert_eq!(frame.to_le_bytes(), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn decode_reverses_encode() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN]);
        let decoded = AudioFrame::from_le_bytes(&frame.to_le_bytes());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        let frame = AudioFrame::from_le_bytes(&[0x01, 0x00, 0xFF]);
        assert_eq!(frame.samples(), &[1]);
    }

}
