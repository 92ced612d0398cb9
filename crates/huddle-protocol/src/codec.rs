//! Codec for encoding and decoding Huddle frames.
//!
//! Frames are UTF-8 JSON objects, one per transport message. Decoding is
//! done in two steps so that an unrecognized type tag can be told apart from
//! a structurally broken frame.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::{AuthRequest, ControlFrame, Envelope, EnvelopeType};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame is not valid JSON.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame is valid JSON but not an object.
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Frame has no `type` tag.
    #[error("Frame has no type tag")]
    MissingType,

    /// Frame carries a type tag the relay does not know.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Frame fields do not match the schema for its type.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// JSON encoding failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Encode a control frame to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_control(frame: &ControlFrame) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

/// Decode a client frame into an envelope.
///
/// # Errors
///
/// Returns an error if the frame is too large, malformed, untagged, carries
/// an unknown type tag, or does not fit the envelope schema.
pub fn decode(data: &[u8], max_size: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    let tag = object
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    if EnvelopeType::parse(tag).is_none() {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Decode a first-frame authentication request.
///
/// # Errors
///
/// Returns an error if the frame is not `{"token": "..."}`.
pub fn decode_auth(data: &[u8]) -> Result<AuthRequest, ProtocolError> {
    serde_json::from_slice(data).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_create() {
        let frame = br#"{"type":"message-create","channelId":"general","content":"hi"}"#;
        let envelope = decode(frame, MAX_FRAME_SIZE).unwrap();

        assert_eq!(envelope.kind, EnvelopeType::MessageCreate);
        assert_eq!(envelope.room, "general");
        assert_eq!(envelope.content.as_deref(), Some("hi"));
        assert!(envelope.sender.is_none());
    }

    #[test]
    fn test_decode_legacy_tag() {
        let frame = br#"{"type":"MESSAGE_CREATE","channelId":"general","content":"hi"}"#;
        let envelope = decode(frame, MAX_FRAME_SIZE).unwrap();
        assert_eq!(envelope.kind, EnvelopeType::MessageCreate);
    }

    #[test]
    fn test_decode_without_room() {
        let frame = br#"{"type":"candidate","payload":{"candidate":"c"}}"#;
        let envelope = decode(frame, MAX_FRAME_SIZE).unwrap();
        assert!(envelope.room.is_empty());
    }

    #[test]
    fn test_decode_rejects() {
        assert!(matches!(
            decode(b"not json", MAX_FRAME_SIZE),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(b"[1,2]", MAX_FRAME_SIZE),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            decode(br#"{"channelId":"general"}"#, MAX_FRAME_SIZE),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            decode(br#"{"type":"typing","channelId":"general"}"#, MAX_FRAME_SIZE),
            Err(ProtocolError::UnknownType(tag)) if tag == "typing"
        ));
        assert!(matches!(
            decode(br#"{"type":"message-create","content":42}"#, MAX_FRAME_SIZE),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let content = "a".repeat(128);
        let frame = format!(r#"{{"type":"message-create","content":"{content}"}}"#);

        match decode(frame.as_bytes(), 64) {
            Err(ProtocolError::FrameTooLarge { max, .. }) => assert_eq!(max, 64),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_is_json_text() {
        let envelope = Envelope::join("general", "user-1");
        let encoded = encode(&envelope).unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.starts_with('{'));
        assert!(text.contains(r#""type":"join""#));
    }

    #[test]
    fn test_decode_auth() {
        let auth = decode_auth(br#"{"token":"abc"}"#).unwrap();
        assert_eq!(auth.token, "abc");
        assert!(decode_auth(br#"{"type":"join"}"#).is_err());
    }
}
