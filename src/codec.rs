//! Wire codec for the prefill/decode channels.
//!
//! Requests and responses are serialized with bincode (standard config) via
//! their serde derives. One message maps to exactly one transport frame.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{PDError, PDResult};
use crate::io_struct::{PDRequest, PDResponse};

fn encode<T: Serialize>(value: &T) -> PDResult<Bytes> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map(Bytes::from)
        .map_err(|e| PDError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> PDResult<T> {
    let (value, consumed) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| PDError::Codec(e.to_string()))?;
    if consumed != data.len() {
        return Err(PDError::Codec(format!(
            "{} trailing bytes after message",
            data.len() - consumed
        )));
    }
    Ok(value)
}

/// Encode a [`PDRequest`] for the prefill or decode channel.
pub fn encode_request(request: &PDRequest) -> PDResult<Bytes> {
    encode(request)
}

/// Decode a [`PDRequest`]; used on the tier side.
pub fn decode_request(data: &[u8]) -> PDResult<PDRequest> {
    decode(data)
}

/// Encode a [`PDResponse`]; used on the tier side.
pub fn encode_response(response: &PDResponse) -> PDResult<Bytes> {
    encode(response)
}

/// Decode a [`PDResponse`] pulled from the inbound channel.
pub fn decode_response(data: &[u8]) -> PDResult<PDResponse> {
    decode(data)
}
