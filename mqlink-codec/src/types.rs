use crate::error::DecodeError;
use crate::utils::decode_variable_length;

/// Largest value representable by the 4-byte remaining-length field.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Decoded MQTT fixed header.
///
/// Covers the first 1 + `header_len - 1` bytes of a control packet: the
/// type/flags byte and the variable-length remaining-length field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type and flags byte
    pub first_byte: u8,
    /// Bytes the fixed header occupies on the wire (2..=5)
    pub header_len: u32,
    /// Byte count of the packet following the fixed header
    pub remaining_length: u32,
}

impl FixedHeader {
    /// Decodes a fixed header from the front of `src` without consuming it.
    ///
    /// `Ok(None)` means the header is not complete yet; the caller keeps the
    /// peeked bytes and retries once more data arrives. The header bytes are
    /// part of the packet and are delivered with it.
    pub fn parse(src: &[u8]) -> Result<Option<FixedHeader>, DecodeError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let first_byte = src[0];
        match decode_variable_length(&src[1..])? {
            Some((remaining_length, consumed)) => Ok(Some(FixedHeader {
                first_byte,
                header_len: consumed as u32 + 1,
                remaining_length,
            })),
            None => Ok(None),
        }
    }

    /// Total on-wire size of the packet this header announces.
    #[inline]
    pub fn packet_size(&self) -> usize {
        self.header_len as usize + self.remaining_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        // remaining length 0x82 0x01 => 2 + 1 * 128 = 130
        let header = FixedHeader::parse(&[0x30, 0x82, 0x01]).unwrap().unwrap();
        assert_eq!(header.first_byte, 0x30);
        assert_eq!(header.header_len, 3);
        assert_eq!(header.remaining_length, 130);
        assert_eq!(header.packet_size(), 133);
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(FixedHeader::parse(&[]).unwrap(), None);
        assert_eq!(FixedHeader::parse(&[0x10]).unwrap(), None);
        assert_eq!(FixedHeader::parse(&[0x10, 0x80]).unwrap(), None);
        assert_eq!(FixedHeader::parse(&[0x10, 0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            FixedHeader::parse(&[0x10, 0x80, 0x80, 0x80, 0x80]),
            Err(DecodeError::InvalidLength)
        ));
    }

    #[test]
    fn test_zero_length_packet() {
        let header = FixedHeader::parse(&[0xc0, 0x00]).unwrap().unwrap();
        assert_eq!(header.header_len, 2);
        assert_eq!(header.remaining_length, 0);
        assert_eq!(header.packet_size(), 2);
    }
}
