//! Message Header Implementation
//!
//! Every channel message starts with the same fixed-length header. The header
//! declares its own length so a receiver can detect framing skew immediately.
//!
//! ```text
//! ┌─────────┬────────────┬──────────────┬──────────────┬─────────┬────────────────┐
//! │ version │ header_len │ message_type │ type_version │ flags   │ payload_length │
//! │ u8      │ u8 (words) │ u16          │ u16          │ u16     │ u32            │
//! └─────────┴────────────┴──────────────┴──────────────┴─────────┴────────────────┘
//!   0         1            2              4              6         8            12
//! ```

use crate::constants::{HEADER_LENGTH, HEADER_LENGTH_WORDS, HEADER_VERSION};
use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::WireRead;
use bytes::{BufMut, Bytes, BytesMut};
use comms_types::MessageType;

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    /// Declared header length in 4-byte words
    pub header_length: u8,
    /// Raw type code; resolved separately so unknown codes surface as their own error
    pub message_type: u16,
    pub message_type_version: u16,
    pub flags: u16,
    pub payload_length: u32,
}

impl MessageHeader {
    /// Header size in bytes
    pub const SIZE: usize = HEADER_LENGTH;

    /// Header for an outbound message of `message_type`
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            version: HEADER_VERSION,
            header_length: HEADER_LENGTH_WORDS,
            message_type: message_type.code(),
            message_type_version: 0,
            flags: 0,
            payload_length,
        }
    }

    /// Declared header length in bytes
    pub fn declared_length(&self) -> usize {
        self.header_length as usize * 4
    }

    /// Resolve the numeric type code
    pub fn resolve_type(&self) -> ProtocolResult<MessageType> {
        MessageType::from_code(self.message_type)
            .map_err(|_| ProtocolError::UnknownMessageType { code: self.message_type })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(Self::SIZE);
        out.put_u8(self.version);
        out.put_u8(self.header_length);
        out.put_u16(self.message_type);
        out.put_u16(self.message_type_version);
        out.put_u16(self.flags);
        out.put_u32(self.payload_length);
    }

    /// Decode and validate the header at the front of `frame`
    ///
    /// On success `frame` is advanced past the header and holds exactly the
    /// declared payload. A declared header length different from
    /// [`HEADER_LENGTH`] is rejected before any other field is trusted.
    pub fn decode(frame: &mut Bytes) -> ProtocolResult<Self> {
        let original = frame.clone();
        if frame.len() < 2 {
            return Err(ProtocolError::message_too_small(Self::SIZE, frame.len(), "MessageHeader"));
        }

        let declared = frame[1] as usize * 4;
        if declared != HEADER_LENGTH {
            return Err(ProtocolError::bad_header_length(declared, HEADER_LENGTH, &original));
        }

        frame.ensure(Self::SIZE, "MessageHeader")?;
        let header = Self {
            version: frame.read_u8("version")?,
            header_length: frame.read_u8("header_length")?,
            message_type: frame.read_u16("message_type")?,
            message_type_version: frame.read_u16("message_type_version")?,
            flags: frame.read_u16("flags")?,
            payload_length: frame.read_u32("payload_length")?,
        };

        if header.version != HEADER_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: header.version,
                supported: HEADER_VERSION,
            });
        }

        if header.payload_length as usize != frame.len() {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared: header.payload_length as usize,
                actual: frame.len(),
            });
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(header: MessageHeader, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        header.encode(&mut out);
        out.put_slice(payload);
        out.freeze()
    }

    #[test]
    fn test_header_size_matches_encoding() {
        let mut out = BytesMut::new();
        MessageHeader::new(MessageType::Ping, 0).encode(&mut out);
        assert_eq!(out.len(), MessageHeader::SIZE);
        assert_eq!(MessageHeader::new(MessageType::Ping, 0).declared_length(), HEADER_LENGTH);
    }

    #[test]
    fn test_decode_leaves_payload() {
        let mut frame = frame_with(MessageHeader::new(MessageType::Pong, 3), b"abc");
        let header = MessageHeader::decode(&mut frame).unwrap();
        assert_eq!(header.resolve_type().unwrap(), MessageType::Pong);
        assert_eq!(&frame[..], b"abc");
    }

    #[test]
    fn test_bad_header_length_is_fatal() {
        let mut header = MessageHeader::new(MessageType::Ping, 0);
        header.header_length = HEADER_LENGTH_WORDS + 1;
        let mut frame = frame_with(header, &[]);
        assert!(matches!(
            MessageHeader::decode(&mut frame),
            Err(ProtocolError::BadHeaderLength { declared: 16, expected: 12, .. })
        ));
    }

    #[test]
    fn test_unknown_type_code_surfaces() {
        let mut header = MessageHeader::new(MessageType::Ping, 0);
        header.message_type = 4000;
        let mut frame = frame_with(header, &[]);
        let decoded = MessageHeader::decode(&mut frame).unwrap();
        assert_eq!(
            decoded.resolve_type(),
            Err(ProtocolError::UnknownMessageType { code: 4000 })
        );
    }

    #[test]
    fn test_payload_length_mismatch() {
        let mut frame = frame_with(MessageHeader::new(MessageType::Ping, 10), b"short");
        assert_eq!(
            MessageHeader::decode(&mut frame),
            Err(ProtocolError::PayloadLengthMismatch { declared: 10, actual: 5 })
        );
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut header = MessageHeader::new(MessageType::Ping, 0);
        header.version = 9;
        let mut frame = frame_with(header, &[]);
        assert!(matches!(
            MessageHeader::decode(&mut frame),
            Err(ProtocolError::UnsupportedVersion { version: 9, .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_any_wrong_declared_length_is_rejected(
            words in 0u8..=255,
            payload in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
        ) {
            proptest::prop_assume!(words != HEADER_LENGTH_WORDS);
            let mut header = MessageHeader::new(MessageType::Ping, payload.len() as u32);
            header.header_length = words;
            let mut frame = frame_with(header, &payload);
            let is_bad_length = matches!(
                MessageHeader::decode(&mut frame),
                Err(ProtocolError::BadHeaderLength { .. })
            );
            proptest::prop_assert!(is_bad_length);
        }
    }
}
