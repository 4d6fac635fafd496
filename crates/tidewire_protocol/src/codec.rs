//! Wire codec for protocol messages.
//!
//! Messages are encoded either as CBOR (`ciborium`) or JSON (`serde_json`).
//! Several messages can be packed into a frame, each preceded by its length
//! as a big-endian `u32`.
//!
//! Decoding is total: any input yields either a [`Message`] or a
//! [`ParseError`] describing why it was rejected.

use crate::error::{CodecError, CodecResult, ParseError};
use crate::messages::{Action, Message, ParserAction, Topic};
use serde_json::Value;

/// Result of decoding one message.
pub type ParseResult = Result<Message, ParseError>;

const LENGTH_PREFIX: usize = 4;

/// Encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Compact binary encoding.
    #[default]
    Cbor,
    /// Text encoding, useful for debugging.
    Json,
}

/// Encodes a single message.
pub fn encode(message: &Message, format: WireFormat) -> CodecResult<Vec<u8>> {
    match format {
        WireFormat::Cbor => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(message, &mut buf)
                .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
            Ok(buf)
        }
        WireFormat::Json => {
            serde_json::to_vec(message).map_err(|e| CodecError::encoding_failed(e.to_string()))
        }
    }
}

/// Decodes a single message.
pub fn decode(bytes: &[u8], format: WireFormat) -> ParseResult {
    let value: Value = match format {
        WireFormat::Cbor => ciborium::de::from_reader(bytes).map_err(|e| {
            ParseError::new(ParserAction::MessageParseError, bytes, e.to_string())
        })?,
        WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| {
            ParseError::new(ParserAction::MessageParseError, bytes, e.to_string())
        })?,
    };
    classify(value, bytes)
}

/// Encodes messages into one length-delimited frame.
pub fn encode_frame(messages: &[Message], format: WireFormat) -> CodecResult<Vec<u8>> {
    let mut frame = Vec::new();
    for message in messages {
        let payload = encode(message, format)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CodecError::FrameTooLarge { len: payload.len() })?;
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
    }
    Ok(frame)
}

/// Decodes every message of a frame.
///
/// A malformed message yields a parse error in its slot and decoding
/// continues with the next one. A truncated tail yields one final parse error.
pub fn decode_frame(bytes: &[u8], format: WireFormat) -> Vec<ParseResult> {
    let mut results = Vec::new();
    let mut rest = bytes;

    while !rest.is_empty() {
        if rest.len() < LENGTH_PREFIX {
            results.push(Err(ParseError::new(
                ParserAction::MessageParseError,
                rest,
                "truncated length prefix",
            )));
            break;
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&rest[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        let body = &rest[LENGTH_PREFIX..];
        if body.len() < len {
            results.push(Err(ParseError::new(
                ParserAction::MessageParseError,
                rest,
                format!("frame declares {len} bytes, {} available", body.len()),
            )));
            break;
        }
        results.push(decode(&body[..len], format));
        rest = &body[len..];
    }

    results
}

fn classify(value: Value, raw: &[u8]) -> ParseResult {
    let Some(envelope) = value.as_object() else {
        return Err(ParseError::new(
            ParserAction::InvalidMessage,
            raw,
            "message is not a map",
        ));
    };
    let Some(action) = envelope.get("action") else {
        return Err(ParseError::new(
            ParserAction::InvalidMessage,
            raw,
            "message has no action",
        ));
    };

    let Some((topic_name, action_value)) = action
        .as_object()
        .filter(|map| map.len() == 1)
        .and_then(|map| map.iter().next())
    else {
        return Err(ParseError::new(
            ParserAction::InvalidMessage,
            raw,
            "action is not a topic-qualified action",
        ));
    };

    if Topic::from_name(topic_name).is_none() {
        return Err(ParseError::new(
            ParserAction::UnknownTopic,
            raw,
            format!("unknown topic {topic_name}"),
        ));
    }
    if serde_json::from_value::<Action>(action.clone()).is_err() {
        return Err(ParseError::new(
            ParserAction::UnknownAction,
            raw,
            format!("unknown action {action_value} for topic {topic_name}"),
        ));
    }

    serde_json::from_value(value)
        .map_err(|e| ParseError::new(ParserAction::InvalidMessage, raw, e.to_string()))
}
