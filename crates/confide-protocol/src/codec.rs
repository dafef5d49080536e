//! Codec for encoding and decoding Confide events.
//!
//! Two encodings carry the same `{"event", "data"}` envelope:
//!
//! - **Text**: plain JSON, one envelope per WebSocket text message.
//! - **Binary**: 4-byte big-endian length prefix followed by the MessagePack
//!   encoding of the envelope.
//!
//! Decoding tolerates a missing or `null` `data` field so that events without
//! a payload (`heartbeat`, `get-available-confidents`) may omit it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum encoded event size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Structurally invalid envelope.
    #[error("Invalid envelope: {0}")]
    Invalid(&'static str),
}

/// Encode an event as a JSON text message.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode_text<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an event from a JSON text message.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope for `T`.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    let value: Value = serde_json::from_str(text)?;
    from_envelope(value)
}

/// Encode an event as a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(event: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode an event from a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let value: Value = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    from_envelope(value)
}

/// Try to decode an event from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let value: Value = rmp_serde::from_slice(&payload)?;

    from_envelope(value).map(Some)
}

/// Deserialize an envelope value, filling in an empty `data` object when absent.
fn from_envelope<T: DeserializeOwned>(mut value: Value) -> Result<T, ProtocolError> {
    let envelope = value
        .as_object_mut()
        .ok_or(ProtocolError::Invalid("envelope must be an object"))?;

    if !envelope.get("event").is_some_and(Value::is_string) {
        return Err(ProtocolError::Invalid("missing event name"));
    }

    if envelope.get("data").map_or(true, Value::is_null) {
        envelope.insert("data".to_string(), Value::Object(Map::new()));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, ServerEvent};
    use serde_json::json;

    #[test]
    fn test_decode_text_client_event() {
        let text = r#"{"event":"webrtc-offer","data":{"targetId":"c-1","offer":{"sdp":"v=0"}}}"#;
        let event: ClientEvent = decode_text(text).unwrap();
        assert_eq!(
            event,
            ClientEvent::WebrtcOffer {
                target_id: "c-1".into(),
                offer: json!({"sdp": "v=0"}),
            }
        );
    }

    #[test]
    fn test_decode_text_without_data() {
        let event: ClientEvent = decode_text(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(event, ClientEvent::Heartbeat { timestamp: None });

        let event: ClientEvent =
            decode_text(r#"{"event":"get-available-confidents","data":null}"#).unwrap();
        assert_eq!(event, ClientEvent::GetAvailableConfidents {});
    }

    #[test]
    fn test_decode_text_rejects_bad_envelopes() {
        assert!(matches!(
            decode_text::<ClientEvent>("[1,2,3]"),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_text::<ClientEvent>(r#"{"data":{}}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(
            decode_text::<ClientEvent>(r#"{"event":"teleport","data":{}}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            decode_text::<ClientEvent>("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_binary_carries_same_envelope() {
        let event = ServerEvent::IceCandidate {
            candidate: json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 9 typ host"}),
            from_id: "u-1".into(),
        };

        let encoded = encode_binary(&event).unwrap();
        let decoded: ServerEvent = decode_binary(&encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_binary(&ServerEvent::call_unavailable()).unwrap();

        match decode_binary::<ServerEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let event = ServerEvent::error("x", "a".repeat(MAX_FRAME_SIZE + 1));

        match encode_text(&event) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
        match encode_binary(&event) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::EndCall {
            target_id: "c-1".into(),
        };
        let second = ClientEvent::Heartbeat { timestamp: Some(7) };

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();
        let tail = buf.split_off(buf.len() - 2);

        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), None);

        buf.unsplit(tail);
        assert_eq!(decode_from::<ClientEvent>(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }
}
