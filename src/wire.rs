//! Wire format for participant messages: hand-written protobuf message
//! types plus an encoding layer that frames every message with a
//! big-endian u16 length prefix.

mod encoding;
pub mod proto;

use core::fmt::Debug;

pub use encoding::ProtoBufEncodingLayer;

use crate::messages::ParticipantMessage;
use crate::Address;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug)]
pub enum Error {
    Encode(prost::EncodeError),
    Decode(prost::DecodeError),
    /// A required sub-message was absent.
    MissingField(&'static str),
    /// A fixed-size field (address, hash, signature) had the wrong length.
    InvalidLength(&'static str),
    UnknownEnumValue(&'static str),
    /// The message does not fit the u16 length prefix.
    MessageTooLarge,
    /// The buffer ends before the frame does.
    IncompleteFrame,
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Self::Encode(e)
    }
}
impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Outgoing raw bytes, one frame per call.
pub trait BytesBus: Debug {
    fn send_to_participant(&self, recipient: Address, msg: &[u8]);
}

/// Typed sending interface the client talks to.
pub trait MessageBus: Debug {
    fn send_to_participant(&self, sender: Address, recipient: Address, msg: ParticipantMessage);
}
