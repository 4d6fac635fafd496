//! # Tidewire Protocol
//!
//! Message types and wire codec for the tidewire real-time sync client.
//!
//! This crate provides:
//! - [`Topic`] and per-topic action enums
//! - The [`Message`] envelope with topic-specific optional fields
//! - CBOR and JSON encoding with length-delimited framing
//! - Total decoding: bad input becomes a [`ParseError`], never a panic
//!
//! ## Usage
//!
//! ```
//! use tidewire_protocol::{decode, encode, Message, RecordAction, WireFormat};
//!
//! let message = Message::named(RecordAction::Read, "user/1");
//! let bytes = encode(&message, WireFormat::Cbor).unwrap();
//! assert_eq!(decode(&bytes, WireFormat::Cbor).unwrap(), message);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{decode, decode_frame, encode, encode_frame, ParseResult, WireFormat};
pub use error::{CodecError, CodecResult, ParseError};
pub use messages::{
    Action, AuthAction, ConnectionAction, EventAction, Message, ParserAction, RecordAction,
    RpcAction, Topic,
};
