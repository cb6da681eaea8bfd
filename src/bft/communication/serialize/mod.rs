//! Serialization of `SystemMessage`s and client operations/replies,
//! abstracted behind the `SharedData` trait so the wire format can be
//! swapped (e.g. for a non-`serde` backend) without touching the
//! protocol layers.

use std::io::{Read, Write};

use crate::bft::communication::message::SystemMessage;
use crate::bft::error::*;

/// Defines how a client operation, its reply, and `SystemMessage`s
/// carrying them are serialized to and deserialized from the wire.
pub trait SharedData {
    /// The type of the operations accepted by the replicated service.
    type State;
    /// The type of a client operation.
    type Request;
    /// The type of a reply to a client operation.
    type Reply;

    /// Serializes a `SystemMessage` into `w`.
    fn serialize_message<W: Write>(w: W, m: &SystemMessage<Self::Request>) -> Result<()>;

    /// Deserializes a `SystemMessage` from `r`.
    fn deserialize_message<R: Read>(r: R) -> Result<SystemMessage<Self::Request>>;
}

#[cfg(feature = "serialize_serde")]
pub struct Serde;

#[cfg(feature = "serialize_serde")]
impl Serde {
    pub fn serialize_message<W, O>(mut w: W, m: &SystemMessage<O>) -> Result<()>
    where
        W: Write,
        O: serde::Serialize,
    {
        let bytes =
            bincode::serialize(m).wrapped_msg(ErrorKind::CommunicationSerialize, "failed to serialize message")?;
        w.write_all(&bytes).wrapped(ErrorKind::CommunicationSerialize)
    }

    pub fn deserialize_message<R, O>(mut r: R) -> Result<SystemMessage<O>>
    where
        R: Read,
        O: serde::de::DeserializeOwned,
    {
        let mut bytes = Vec::new();
        r.read_to_end(&mut bytes).wrapped(ErrorKind::CommunicationSerialize)?;
        bincode::deserialize(&bytes)
            .wrapped_msg(ErrorKind::CommunicationSerialize, "failed to deserialize message")
    }
}
