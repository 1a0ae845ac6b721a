use std::cell::Cell;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::types::FixedHeader;

#[derive(Debug, Clone)]
/// Opaque MQTT frame codec
///
/// Extracts whole control packets (fixed header included) from a byte stream.
/// Feeding the same bytes in any chunking yields the same sequence of frames.
pub struct FrameCodec {
    state: Cell<DecodeState>,
    max_size: Cell<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl FrameCodec {
    /// Create `FrameCodec` instance
    pub fn new(max_packet_size: u32) -> Self {
        FrameCodec { state: Cell::new(DecodeState::FrameHeader), max_size: Cell::new(max_packet_size) }
    }

    /// Set max inbound frame size.
    ///
    /// If max size is set to `0`, size is unlimited.
    /// By default max size is set to `0`
    pub fn set_max_size(&mut self, size: u32) {
        self.max_size.set(size);
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => {
                    // header bytes stay in `src`, they are the first bytes of
                    // the emitted frame
                    match FixedHeader::parse(src.as_ref())? {
                        Some(fixed) => {
                            let max_size = self.max_size.get();
                            if max_size != 0 && max_size < fixed.remaining_length {
                                return Err(DecodeError::MaxSizeExceeded);
                            }
                            self.state.set(DecodeState::Frame(fixed));
                        }
                        None => {
                            return Ok(None);
                        }
                    }
                }
                DecodeState::Frame(fixed) => {
                    let total = fixed.packet_size();
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }
                    let frame = src.split_to(total).freeze();
                    self.state.set(DecodeState::FrameHeader);
                    src.reserve(2);
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = EncodeError;

    /// Outbound packets arrive already framed by their encoder; pass through.
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_zero_length_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x10u8, 0x00][..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![Bytes::from_static(&[0x10, 0x00])]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incomplete_frame_consumes_nothing() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x30u8, 0x05, 0xaa, 0xbb][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&[0xcc, 0xdd, 0xee]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ref(), &[0x30, 0x05, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
    }

    #[test]
    fn test_chunking_invariance() {
        // two PUBLISH frames plus a PINGRESP back to back
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0x30, 0x03, 1, 2, 3]);
        stream.extend_from_slice(&[0x32, 0x82, 0x01]);
        stream.extend_from_slice(&vec![0x55u8; 130]);
        stream.extend_from_slice(&[0xd0, 0x00]);

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&stream[..]);
        let one_shot = decode_all(&mut codec, &mut buf);
        assert_eq!(one_shot.len(), 3);

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let mut byte_at_a_time = Vec::new();
        for b in &stream {
            buf.extend_from_slice(&[*b]);
            byte_at_a_time.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(one_shot, byte_at_a_time);
    }

    #[test]
    fn test_max_size() {
        let mut codec = FrameCodec::default();
        codec.set_max_size(5);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x30\x09");
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));
    }

    #[test]
    fn test_malformed_remaining_length() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x30u8, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn test_encode_is_pass_through() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(&[0x10, 0x00]), &mut dst).unwrap();
        assert_eq!(dst.as_ref(), &[0x10, 0x00]);
    }
}
