//! Action Message Format
//!
//! Command and data messages are sequences of AMF values. The session layer
//! only sees [`CommandCodec`]; AMF0 is the one encoding implemented, and
//! AMF3-flagged messages are handled by stripping their leading format byte
//! before decoding the AMF0 body.

pub mod amf0;
pub mod value;

use bytes::{Bytes, BytesMut};

pub use value::{AmfObject, AmfValue};

use crate::error::AmfError;

/// Encoding of command and data message payloads
pub trait CommandCodec: Send + Sync {
    /// Decode a whole payload into its values
    fn decode(&self, payload: &[u8]) -> Result<Vec<AmfValue>, AmfError>;

    /// Encode values into a payload
    fn encode(&self, values: &[AmfValue]) -> Bytes;
}

/// AMF0 command codec
#[derive(Debug, Default, Clone, Copy)]
pub struct Amf0Codec;

impl CommandCodec for Amf0Codec {
    fn decode(&self, payload: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
        amf0::decode_all(payload)
    }

    fn encode(&self, values: &[AmfValue]) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        for value in values {
            amf0::encode_into(&mut out, value);
        }
        out.freeze()
    }
}
