//! Packet payload coders and the decoded [`Packet`] handed to handlers.
//!
//! A [`Coder`] turns a value into payload bytes and back. Coders are
//! registered per opcode on a service; the transport's I/O threads run the
//! decoder before the packet reaches the tick thread, so handlers receive the
//! typed value through [`Packet::decoded`].

use std::any::Any;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use harbor_net::SessionId;

use crate::error::{CodecError, ServiceError};

/// A payload type that can be written to and read from packet bytes.
pub trait Coder: Any + Send + Sync + Sized {
    /// Append the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decode a value from a complete payload.
    fn decode(payload: &[u8]) -> Result<Self, CodecError>;
}

impl Coder for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

impl Coder for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(std::str::from_utf8(payload)?.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// An inbound packet as seen by handlers and facades.
pub struct Packet {
    /// Session the packet arrived on.
    pub session_id: SessionId,
    /// Routing opcode. Always 0 for raw services.
    pub opcode: u32,
    /// Application status from the packet header. Always 0 for raw services.
    pub status: i32,
    /// Undecoded payload bytes.
    pub payload: Bytes,
    decoded: Option<Box<dyn Any + Send + Sync>>,
}

impl Packet {
    /// Build a packet without a decoded value.
    pub fn new(session_id: SessionId, opcode: u32, status: i32, payload: Bytes) -> Self {
        Self {
            session_id,
            opcode,
            status,
            payload,
            decoded: None,
        }
    }

    /// The value produced by the opcode's coder, if one was registered and
    /// its type is `C`.
    pub fn decoded<C: Coder>(&self) -> Option<&C> {
        self.decoded.as_ref()?.downcast_ref::<C>()
    }

    /// Whether a coder ran on this packet.
    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("session_id", &self.session_id)
            .field("opcode", &self.opcode)
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .field("decoded", &self.decoded.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Coder table
// ---------------------------------------------------------------------------

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, CodecError>;

fn decode_erased<C: Coder>(payload: &[u8]) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
    Ok(Box::new(C::decode(payload)?))
}

/// Opcode to decoder table, written before start and read from I/O threads.
#[derive(Default)]
pub(crate) struct CoderTable {
    decoders: DashMap<u32, DecodeFn>,
}

impl CoderTable {
    pub(crate) fn register<C: Coder>(&self, opcode: u32) -> Result<(), ServiceError> {
        match self.decoders.entry(opcode) {
            Entry::Occupied(_) => Err(ServiceError::AlreadyRegistered { opcode }),
            Entry::Vacant(slot) => {
                slot.insert(decode_erased::<C>);
                Ok(())
            }
        }
    }

    pub(crate) fn contains(&self, opcode: u32) -> bool {
        self.decoders.contains_key(&opcode)
    }

    /// Run the decoder for `packet.opcode`.
    ///
    /// Returns `Ok(false)` and leaves the packet untouched when no coder is
    /// registered for the opcode.
    pub(crate) fn decode_into(&self, packet: &mut Packet) -> Result<bool, CodecError> {
        // Copy the fn pointer out so the shard lock is not held while decoding.
        let Some(decode) = self.decoders.get(&packet.opcode).map(|entry| *entry) else {
            return Ok(false);
        };
        packet.decoded = Some(decode(&packet.payload)?);
        Ok(true)
    }
}
