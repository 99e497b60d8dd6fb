use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rand::RngCore;
use thiserror::Error;

use crate::protocol::{now_millis, ChannelMessage};

pub const SEQUENCE_NUMBER_SIZE: usize = 2;
pub const TIMESTAMP_SIZE: usize = 8;
pub const MIN_FRAME_SIZE: usize = SEQUENCE_NUMBER_SIZE + TIMESTAMP_SIZE;

/// The wire field is 16 bits wide, but the bound is kept far below its capacity. This caps
///  rate x duration per run, and it is a deliberate policy limit rather than a codec limit.
pub const MAX_SEQUENCE_NUMBER: u16 = 1000;


#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("total frame size must be at least {min} bytes, got {0}", min = MIN_FRAME_SIZE)]
    InvalidSize(usize),
    #[error("sequence number must be at most {max}, got {0}", max = MAX_SEQUENCE_NUMBER)]
    InvalidSequenceNumber(u16),
    #[error("buffer of {0} bytes is too small to hold a frame header")]
    TooSmall(usize),
    #[error("expected a binary frame, got a text message")]
    WrongType,
}


/// The decoded fixed-size header of a test frame. The filler after the header is
///  never interpreted and is dropped on decoding.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub sequence_number: u16,
    pub send_timestamp_millis: i64,
}

/// Encodes a test frame of exactly `total_size` bytes: the sequence number as a big-endian
///  u16, the current time in milliseconds since the epoch as a big-endian i64, and random
///  filler for the rest.
pub fn encode(sequence_number: u16, total_size: usize) -> Result<Bytes, FrameError> {
    encode_at(sequence_number, now_millis(), total_size)
}

/// Same as [encode], but with the send timestamp passed in explicitly.
pub fn encode_at(sequence_number: u16, send_timestamp_millis: i64, total_size: usize) -> Result<Bytes, FrameError> {
    if total_size < MIN_FRAME_SIZE {
        return Err(FrameError::InvalidSize(total_size));
    }
    if sequence_number > MAX_SEQUENCE_NUMBER {
        return Err(FrameError::InvalidSequenceNumber(sequence_number));
    }

    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_u16(sequence_number);
    buf.put_i64(send_timestamp_millis);

    let mut filler = vec![0u8; total_size - MIN_FRAME_SIZE];
    rand::thread_rng().fill_bytes(&mut filler);
    buf.extend_from_slice(&filler);

    Ok(buf.freeze())
}

/// Reads back the header of a received frame. The sequence number is decodable on its own,
///  so a truncated buffer of at least two bytes would still identify the packet - but the
///  receiver records the send timestamp as well, so the full header is required here.
pub fn decode(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    let len = buf.len();
    let mut buf = buf;

    let sequence_number = buf.try_get_u16().map_err(|_| FrameError::TooSmall(len))?;
    let send_timestamp_millis = buf.try_get_i64().map_err(|_| FrameError::TooSmall(len))?;

    Ok(FrameHeader {
        sequence_number,
        send_timestamp_millis,
    })
}

/// Guard for callers that multiplex text and binary on the same channel.
pub fn decode_message(message: &ChannelMessage) -> Result<FrameHeader, FrameError> {
    match message {
        ChannelMessage::Binary(buf) => decode(buf),
        ChannelMessage::Text(_) => Err(FrameError::WrongType),
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::min_size(0, MIN_FRAME_SIZE)]
    #[case::small(17, 64)]
    #[case::typical(499, 512)]
    #[case::upper_bound(MAX_SEQUENCE_NUMBER, 1200)]
    fn test_encode_decode_round_trip(#[case] seq: u16, #[case] total_size: usize) {
        let frame = encode_at(seq, 1_234_567_890_123, total_size).unwrap();
        assert_eq!(frame.len(), total_size);

        let header = decode(&frame).unwrap();
        assert_eq!(header.sequence_number, seq);
        assert_eq!(header.send_timestamp_millis, 1_234_567_890_123);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::tiny(2)]
    #[case::one_below_min(MIN_FRAME_SIZE - 1)]
    fn test_encode_rejects_undersized_frame(#[case] total_size: usize) {
        assert_eq!(encode(0, total_size), Err(FrameError::InvalidSize(total_size)));
    }

    #[rstest]
    #[case(MAX_SEQUENCE_NUMBER + 1)]
    #[case(u16::MAX)]
    fn test_encode_rejects_out_of_bound_sequence_number(#[case] seq: u16) {
        assert_eq!(encode(seq, 512), Err(FrameError::InvalidSequenceNumber(seq)));
    }

    #[test]
    fn test_encode_header_layout() {
        let frame = encode_at(0x0102, 0x0a0b0c0d0e0f1011, 12).unwrap();
        assert_eq!(
            &frame[..MIN_FRAME_SIZE],
            &[0x01, 0x02, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11],
        );
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::two_bytes(&[0x00, 0x07])]
    #[case::header_truncated(&[0x00, 0x07, 0x01, 0x02, 0x03])]
    fn test_decode_rejects_truncated_buffer(#[case] buf: &[u8]) {
        assert_eq!(decode(buf), Err(FrameError::TooSmall(buf.len())));
    }

    #[rstest]
    #[case(FrameError::InvalidSize(4), "total frame size must be at least 10 bytes, got 4")]
    #[case(FrameError::InvalidSequenceNumber(1001), "sequence number must be at most 1000, got 1001")]
    #[case(FrameError::TooSmall(3), "buffer of 3 bytes is too small to hold a frame header")]
    #[case(FrameError::WrongType, "expected a binary frame, got a text message")]
    fn test_error_message(#[case] error: FrameError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[test]
    fn test_decode_message_rejects_text() {
        let message = ChannelMessage::Text("send start".to_string());
        assert_eq!(decode_message(&message), Err(FrameError::WrongType));

        let frame = encode_at(3, 99, 32).unwrap();
        let header = decode_message(&ChannelMessage::Binary(frame)).unwrap();
        assert_eq!(header.sequence_number, 3);
    }
}
