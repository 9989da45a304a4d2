//! Envelope codec.
//!
//! Envelopes use the protobuf encoding of the validator `Message` schema:
//!
//! ```text
//! message Message {
//!     MessageType message_type = 1;   // varint
//!     string correlation_id = 2;      // length-delimited
//!     bytes content = 3;              // length-delimited
//! }
//! ```
//!
//! Default-valued fields are omitted when encoding and defaulted when
//! decoding. Unknown fields are skipped, so frames from newer peers still
//! decode.

use crate::domain::{CorrelationId, DecodingError, EncodingError, Envelope, MessageType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

const FIELD_MESSAGE_TYPE: u64 = 1;
const FIELD_CORRELATION_ID: u64 = 2;
const FIELD_CONTENT: u64 = 3;

/// Encode a typed envelope. Cannot fail: the types already hold the invariants.
pub fn encode(envelope: &Envelope) -> Bytes {
    write_message(
        envelope.message_type().as_i32(),
        envelope.correlation_id().as_str().as_bytes(),
        envelope.content(),
    )
}

/// Encode raw parts, checking the invariants a typed `Envelope` carries.
pub fn encode_parts(
    message_type: i32,
    correlation_id: &str,
    content: &[u8],
) -> Result<Bytes, EncodingError> {
    MessageType::try_from(message_type).map_err(EncodingError::UnknownMessageType)?;
    if correlation_id.is_empty() {
        return Err(EncodingError::EmptyCorrelationId);
    }
    Ok(write_message(message_type, correlation_id.as_bytes(), content))
}

/// Decode one envelope from a complete frame.
pub fn decode(mut frame: Bytes) -> Result<Envelope, DecodingError> {
    let mut message_type: i64 = 0;
    let mut correlation_id = Bytes::new();
    let mut content = Bytes::new();

    while frame.has_remaining() {
        let key = get_varint(&mut frame, "field key")?;
        let field = key >> 3;
        let wire_type = (key & 0x07) as u8;

        if field == 0 {
            return Err(DecodingError::InvalidFieldNumber);
        }

        match (field, wire_type) {
            (FIELD_MESSAGE_TYPE, WIRE_VARINT) => {
                message_type = get_varint(&mut frame, "message_type")? as i64;
            }
            (FIELD_CORRELATION_ID, WIRE_LEN) => {
                correlation_id = get_len_delimited(&mut frame, "correlation_id")?;
            }
            (FIELD_CONTENT, WIRE_LEN) => {
                content = get_len_delimited(&mut frame, "content")?;
            }
            (FIELD_MESSAGE_TYPE | FIELD_CORRELATION_ID | FIELD_CONTENT, _) => {
                return Err(DecodingError::UnsupportedWireType { field, wire_type });
            }
            _ => skip_field(&mut frame, field, wire_type)?,
        }
    }

    let message_type = i32::try_from(message_type)
        .ok()
        .and_then(|tag| MessageType::try_from(tag).ok())
        .ok_or(DecodingError::UnknownMessageType(message_type))?;

    let correlation_id = std::str::from_utf8(&correlation_id)
        .map_err(|_| DecodingError::InvalidCorrelationId)
        .and_then(|s| CorrelationId::parse(s).map_err(|_| DecodingError::MissingCorrelationId))?;

    Ok(Envelope::new(message_type, correlation_id, content))
}

fn write_message(message_type: i32, correlation_id: &[u8], content: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(correlation_id.len() + content.len() + 24);

    if message_type != 0 {
        put_key(&mut buf, FIELD_MESSAGE_TYPE, WIRE_VARINT);
        // Negative enum values are sign-extended to ten bytes, as protobuf does.
        put_varint(&mut buf, i64::from(message_type) as u64);
    }

    if !correlation_id.is_empty() {
        put_key(&mut buf, FIELD_CORRELATION_ID, WIRE_LEN);
        put_varint(&mut buf, correlation_id.len() as u64);
        buf.put_slice(correlation_id);
    }

    if !content.is_empty() {
        put_key(&mut buf, FIELD_CONTENT, WIRE_LEN);
        put_varint(&mut buf, content.len() as u64);
        buf.put_slice(content);
    }

    buf.freeze()
}

fn put_key(buf: &mut BytesMut, field: u64, wire_type: u8) {
    put_varint(buf, (field << 3) | u64::from(wire_type));
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut Bytes, what: &'static str) -> Result<u64, DecodingError> {
    let mut value = 0u64;
    for i in 0..10 {
        if !buf.has_remaining() {
            return Err(DecodingError::Truncated(what));
        }
        let byte = buf.get_u8();
        if i == 9 && byte > 0x01 {
            return Err(DecodingError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodingError::VarintOverflow)
}

fn get_len_delimited(buf: &mut Bytes, what: &'static str) -> Result<Bytes, DecodingError> {
    let len = get_varint(buf, what)?;
    let len = usize::try_from(len).map_err(|_| DecodingError::Truncated(what))?;
    if buf.remaining() < len {
        return Err(DecodingError::Truncated(what));
    }
    Ok(buf.copy_to_bytes(len))
}

fn skip_field(buf: &mut Bytes, field: u64, wire_type: u8) -> Result<(), DecodingError> {
    let skip = match wire_type {
        WIRE_VARINT => {
            get_varint(buf, "unknown field")?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_FIXED32 => 4,
        WIRE_LEN => {
            get_len_delimited(buf, "unknown field")?;
            return Ok(());
        }
        _ => return Err(DecodingError::UnsupportedWireType { field, wire_type }),
    };

    if buf.remaining() < skip {
        return Err(DecodingError::Truncated("unknown field"));
    }
    buf.advance(skip);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn envelope(kind: MessageType, id: &str, content: &'static [u8]) -> Envelope {
        Envelope::new(kind, CorrelationId::parse(id).unwrap(), content)
    }

    #[test]
    fn test_known_encoding() {
        let env = envelope(MessageType::TpStateGetRequest, "ab", &[1, 2]);
        let bytes = encode(&env);
        assert_eq!(
            bytes.as_ref(),
            &[0x08, 0x07, 0x12, 0x02, b'a', b'b', 0x1a, 0x02, 0x01, 0x02]
        );
    }

    #[test]
    fn test_multi_byte_varint_tag() {
        let env = envelope(MessageType::PingRequest, "p", &[]);
        let bytes = encode(&env);
        // 900 = 0b111_0000100 -> 0x84 0x07
        assert_eq!(&bytes[..3], &[0x08, 0x84, 0x07]);
        assert_eq!(decode(bytes).unwrap(), env);
    }

    #[test]
    fn test_default_fields_omitted() {
        let env = envelope(MessageType::Default, "x", &[]);
        let bytes = encode(&env);
        assert_eq!(bytes.as_ref(), &[0x12, 0x01, b'x']);
        assert_eq!(decode(bytes).unwrap(), env);
    }

    #[test]
    fn test_encode_parts_validates() {
        assert_eq!(
            encode_parts(17, "id", b""),
            Err(EncodingError::UnknownMessageType(17))
        );
        assert_eq!(
            encode_parts(7, "", b""),
            Err(EncodingError::EmptyCorrelationId)
        );

        let bytes = encode_parts(8, "id", b"value1").unwrap();
        let env = decode(bytes).unwrap();
        assert_eq!(env.message_type(), MessageType::TpStateGetResponse);
        assert_eq!(env.content().as_ref(), b"value1");
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let bytes = encode(&envelope(MessageType::TpProcessRequest, "abc", b"payload"));
        // [08 05] [12 03 a b c] [1a 07 p a y l o a d]
        let id_field = 2..7;
        let content_field = 7..bytes.len();

        for cut in (id_field.start + 1..id_field.end).chain(content_field.start + 1..content_field.end)
        {
            assert!(
                matches!(decode(bytes.slice(..cut)), Err(DecodingError::Truncated(_))),
                "prefix of {} bytes should be truncated",
                cut
            );
        }

        // Cutting on a field boundary drops the content, which is a valid empty payload.
        let env = decode(bytes.slice(..content_field.start)).unwrap();
        assert!(env.content().is_empty());
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let frame = Bytes::from_static(&[0x08, 0x11, 0x12, 0x01, b'a']);
        assert_eq!(decode(frame), Err(DecodingError::UnknownMessageType(17)));
    }

    #[test]
    fn test_missing_correlation_id_rejected() {
        let frame = Bytes::from_static(&[0x08, 0x07, 0x1a, 0x01, 0xff]);
        assert_eq!(decode(frame), Err(DecodingError::MissingCorrelationId));
    }

    #[test]
    fn test_invalid_utf8_correlation_id_rejected() {
        let frame = Bytes::from_static(&[0x12, 0x02, 0xc3, 0x28]);
        assert_eq!(decode(frame), Err(DecodingError::InvalidCorrelationId));
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&encode(&envelope(
            MessageType::TpEventAddRequest,
            "evt",
            b"data",
        )));
        // field 4 varint, field 5 fixed32, field 6 length-delimited, field 7 fixed64
        frame.extend_from_slice(&[0x20, 0x96, 0x01]);
        frame.extend_from_slice(&[0x2d, 1, 2, 3, 4]);
        frame.extend_from_slice(&[0x32, 0x02, 9, 9]);
        frame.extend_from_slice(&[0x39, 1, 2, 3, 4, 5, 6, 7, 8]);

        let env = decode(frame.freeze()).unwrap();
        assert_eq!(env.message_type(), MessageType::TpEventAddRequest);
        assert_eq!(env.correlation_id().as_str(), "evt");
        assert_eq!(env.content().as_ref(), b"data");
    }

    #[test]
    fn test_wrong_wire_type_for_known_field() {
        // correlation_id sent as varint
        let frame = Bytes::from_static(&[0x10, 0x01]);
        assert_eq!(
            decode(frame),
            Err(DecodingError::UnsupportedWireType {
                field: 2,
                wire_type: 0
            })
        );
    }

    #[test]
    fn test_group_wire_type_rejected() {
        let frame = Bytes::from_static(&[0x12, 0x01, b'a', 0x23]);
        assert!(matches!(
            decode(frame),
            Err(DecodingError::UnsupportedWireType { field: 4, wire_type: 3 })
        ));
    }

    #[test]
    fn test_varint_overflow() {
        let frame = Bytes::from_static(&[
            0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f,
        ]);
        assert_eq!(decode(frame), Err(DecodingError::VarintOverflow));
    }

    #[test]
    fn test_field_zero_rejected() {
        let frame = Bytes::from_static(&[0x00, 0x01]);
        assert_eq!(decode(frame), Err(DecodingError::InvalidFieldNumber));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            kind_index in 0..MessageType::ALL.len(),
            id in "[a-zA-Z0-9_-]{1,80}",
            content in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let kind = MessageType::ALL[kind_index];
            let env = Envelope::new(kind, CorrelationId::parse(id).unwrap(), content);
            let decoded = decode(encode(&env)).unwrap();
            prop_assert_eq!(decoded, env);
        }
    }
}
