//! Frame codec: a big-endian u16 opcode followed by a bincode payload.

use crate::{Opcode, OPCODE_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short ({0} bytes)")]
    ShortFrame(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub fn encode_frame<T: Serialize>(opcode: Opcode, payload: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(payload)?;
    let mut frame = Vec::with_capacity(OPCODE_LEN + body.len());
    frame.extend_from_slice(&opcode.as_u16().to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Splits a frame into its raw opcode and payload without validating the opcode.
pub fn split_frame(frame: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    if frame.len() < OPCODE_LEN {
        return Err(ProtocolError::ShortFrame(frame.len()));
    }
    let raw = u16::from_be_bytes([frame[0], frame[1]]);
    Ok((raw, &frame[OPCODE_LEN..]))
}

pub fn decode_frame(frame: &[u8]) -> Result<(Opcode, &[u8]), ProtocolError> {
    let (raw, payload) = split_frame(frame)?;
    let opcode = Opcode::from_u16(raw).ok_or(ProtocolError::UnknownOpcode(raw))?;
    Ok((opcode, payload))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(payload)?)
}
