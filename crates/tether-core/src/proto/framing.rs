//! Length-prefixed frame codec for the provider protocol.
//!
//! Each frame is a 4-byte big-endian length followed by the payload:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The codec enforces bounded reads: frame length is validated against the
//! maximum before any allocation, and oversized frames fail with
//! [`ProtocolError::FrameTooLarge`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

/// Length of the frame header (4 bytes for a u32 length prefix).
const HEADER_LEN: usize = 4;

/// Frame codec implementing length-prefixed binary framing.
///
/// Used with [`tokio_util::codec::Framed`] to provide frame-based I/O over
/// the transport stream. Empty frames (length 0) are valid.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Creates a codec with the protocol's default maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Creates a codec with a custom maximum frame size.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
        }
    }

    /// The maximum frame size for this codec.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Read the length prefix without consuming it; validate before
        // reserving or allocating anything.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(length, self.max_frame_size));
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> ProtocolResult<()> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_size above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello world");

        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + payload.len());
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_yields_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn partial_payload_yields_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3, 4, 5][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn oversized_length_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let oversized = 20 * 1024 * 1024u32;
        let mut buf = BytesMut::new();
        buf.put_u32(oversized);
        buf.extend_from_slice(&[0u8; 64]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size, max })
                if size == oversized as usize && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn oversized_encode_rejected() {
        let mut codec = FrameCodec::with_max_size(100);
        let mut buf = BytesMut::new();
        let result = codec.encode(Bytes::from(vec![0u8; 200]), &mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 200, max: 100 })
        ));
    }

    #[test]
    fn empty_frame_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let first = Bytes::from_static(b"first");
        let second = Bytes::from_static(b"second");

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "exceeds protocol limit")]
    fn custom_max_above_limit_panics() {
        let _ = FrameCodec::with_max_size(MAX_FRAME_SIZE + 1);
    }
}
