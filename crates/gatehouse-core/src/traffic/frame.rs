//! Handoff frame: the binary descriptor that correlates inherited OS file
//! handles with the listener metadata needed to reconstruct them.
//!
//! # Wire format
//!
//! A frame is a 4-byte big-endian length prefix followed by a
//! protobuf-encoded [`TrafficFrame`] payload. The attached file handles
//! travel out-of-band (inherited descriptors on exec); each entry's
//! `fd_index` names the descriptor slot the handle occupies in the child,
//! and entry order matches handle order (positional correlation).
//!
//! The length prefix is validated against [`MAX_TRAFFIC_FRAME_SIZE`] before
//! any allocation.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Maximum size of an encoded traffic frame payload in bytes (256 KiB).
///
/// Listener metadata is small; a frame larger than this indicates a
/// corrupted or hostile stream and is rejected before allocation.
pub const MAX_TRAFFIC_FRAME_SIZE: usize = 256 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// One listener in a handoff frame.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct TrafficEntry {
    /// Descriptor slot the listener's handle occupies in the child process.
    #[prost(uint64, tag = "1")]
    pub fd_index: u64,
    /// Listen address as requested from configuration, e.g.
    /// `127.0.0.1:9400`. Kept verbatim so the successor's bind of the
    /// same config string finds the adopted listener.
    #[prost(string, tag = "2")]
    pub address: String,
    /// Listener network: `tcp`, `tcp4`, or `tcp6`.
    #[prost(string, tag = "3")]
    pub network: String,
}

/// The ordered set of listeners serialized for one handoff.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct TrafficFrame {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<TrafficEntry>,
}

/// Errors produced by frame encoding and decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame payload exceeds the maximum allowed size.
    #[error("traffic frame size {size} exceeds maximum allowed size {max}")]
    TooLarge {
        /// Actual payload size in bytes.
        size: usize,
        /// Maximum allowed payload size in bytes.
        max: usize,
    },

    /// Frame payload is not a valid protobuf message.
    #[error("failed to decode traffic frame: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error reading the frame from the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encodes a frame as length-prefixed bytes ready for the handoff pipe.
pub fn encode_frame(frame: &TrafficFrame) -> Result<Bytes, FrameError> {
    let payload = frame.encode_to_vec();
    if payload.len() > MAX_TRAFFIC_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_TRAFFIC_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Reads one length-prefixed frame from a blocking reader.
///
/// This is the successor-startup path: frames arrive on inherited standard
/// input before the async runtime exists, so the read is synchronous. Two
/// frames written back-to-back (admin pool, then gateway pool) are consumed
/// by calling this twice on the same reader.
pub fn read_frame(reader: &mut impl Read) -> Result<TrafficFrame, FrameError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix)?;

    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_TRAFFIC_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size,
            max: MAX_TRAFFIC_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload)?;
    Ok(TrafficFrame::decode(payload.as_slice())?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_frame() -> TrafficFrame {
        TrafficFrame {
            entries: vec![
                TrafficEntry {
                    fd_index: 3,
                    address: "127.0.0.1:9000".to_string(),
                    network: "tcp".to_string(),
                },
                TrafficEntry {
                    fd_index: 4,
                    address: "127.0.0.1:9001".to_string(),
                    network: "tcp".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame).expect("encode failed");

        let mut cursor = Cursor::new(bytes.as_ref());
        let decoded = read_frame(&mut cursor).expect("read failed");

        assert_eq!(decoded, frame);
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let first = sample_frame();
        let second = TrafficFrame {
            entries: vec![TrafficEntry {
                fd_index: 5,
                address: "0.0.0.0:8080".to_string(),
                network: "tcp4".to_string(),
            }],
        };

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(&first).unwrap());
        stream.extend_from_slice(&encode_frame(&second).unwrap());

        let mut cursor = Cursor::new(stream.as_slice());
        assert_eq!(read_frame(&mut cursor).unwrap(), first);
        assert_eq!(read_frame(&mut cursor).unwrap(), second);
    }

    #[test]
    fn test_empty_frame_roundtrip() {
        let frame = TrafficFrame::default();
        let bytes = encode_frame(&frame).unwrap();

        let mut cursor = Cursor::new(bytes.as_ref());
        let decoded = read_frame(&mut cursor).unwrap();
        assert!(decoded.entries.is_empty());
    }

    #[test]
    fn test_oversized_prefix_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 16]);

        let mut cursor = Cursor::new(bytes.as_slice());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max, .. } if max == MAX_TRAFFIC_FRAME_SIZE));
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame).unwrap();

        let truncated = &bytes[..bytes.len() - 3];
        let mut cursor = Cursor::new(truncated);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let payload = [0xffu8; 8];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&payload);

        let mut cursor = Cursor::new(bytes.as_slice());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }
}
