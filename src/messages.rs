//! Wire messages & framing
//!
//! Every message travels as a frame: a fixed little-endian header (magic,
//! serialization version, one-byte type tag, body length) followed by a
//! bincode body. The version is compared exactly; a mismatch drops the
//! frame with [`ProtocolError::VersionMismatch`]. Ciphertexts and keys ride
//! inside the bodies in their canonical serialized form.
//!
//! Receiver→sender operations and sender→receiver responses are tagged
//! unions; result packages are independent records keyed by `bundle_idx`
//! and streamed after the query response.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::he::{Ciphertext, RelinKeys};
use crate::params::PsiParams;

/// Exact-match serialization version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame preamble, shared by every message.
const FRAME_MAGIC: u32 = 0xA5D1_F7A3;

/// Upper bound on a frame body; anything larger is malformed.
const MAX_BODY_BYTES: u64 = 1 << 32;

/// Errors surfaced by framing and transport.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame magic mismatch")]
    BadMagic,
    #[error("serialization version {got} does not match {expected}")]
    VersionMismatch { got: u32, expected: u32 },
    #[error("unknown frame tag {0}")]
    UnknownFrameTag(u8),
    #[error("unexpected message type {0:?}")]
    UnexpectedMessageType(FrameType),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("I/O failure: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        // EOF mid-frame means the peer went away.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ChannelClosed
        } else {
            ProtocolError::Io(err)
        }
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::MalformedMessage(err.to_string())
    }
}

/// One-byte frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    SopParms = 1,
    SopOprf = 2,
    SopQuery = 3,
    RspParms = 4,
    RspOprf = 5,
    RspQuery = 6,
    ResultPackage = 7,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::SopParms),
            2 => Some(Self::SopOprf),
            3 => Some(Self::SopQuery),
            4 => Some(Self::RspParms),
            5 => Some(Self::RspOprf),
            6 => Some(Self::RspQuery),
            7 => Some(Self::ResultPackage),
            _ => None,
        }
    }

    /// Whether this tag is a receiver→sender operation.
    pub fn is_operation(self) -> bool {
        matches!(self, Self::SopParms | Self::SopOprf | Self::SopQuery)
    }

    /// Whether this tag is a sender→receiver response.
    pub fn is_response(self) -> bool {
        matches!(self, Self::RspParms | Self::RspOprf | Self::RspQuery)
    }
}

// ============================================================================
// Bodies
// ============================================================================

/// Blinded points, concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OprfRequest {
    pub data: Vec<u8>,
}

/// The encrypted query: the receiver's relinearization keys and, for every
/// submitted power, one ciphertext per bundle index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub relin_keys: RelinKeys,
    pub data: BTreeMap<u32, Vec<Ciphertext>>,
}

/// Receiver→sender operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SenderOperation {
    Parms,
    Oprf(OprfRequest),
    Query(QueryRequest),
}

impl SenderOperation {
    pub fn frame_type(&self) -> FrameType {
        match self {
            SenderOperation::Parms => FrameType::SopParms,
            SenderOperation::Oprf(_) => FrameType::SopOprf,
            SenderOperation::Query(_) => FrameType::SopQuery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParmsResponse {
    pub params: PsiParams,
}

/// Evaluated points; same byte length as the request blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OprfResponse {
    pub data: Vec<u8>,
}

/// Top-level query answer, sent before any result package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub package_count: u32,
}

/// Sender→receiver responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Parms(ParmsResponse),
    Oprf(OprfResponse),
    Query(QueryResponse),
}

impl Response {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Response::Parms(_) => FrameType::RspParms,
            Response::Oprf(_) => FrameType::RspOprf,
            Response::Query(_) => FrameType::RspQuery,
        }
    }
}

/// One bundle's contribution to a query answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPackage {
    pub bundle_idx: u32,
    pub label_byte_count: u32,
    pub nonce_byte_count: u32,
    pub psi_result: Ciphertext,
    pub label_result: Vec<Ciphertext>,
}

// ============================================================================
// Framing
// ============================================================================

/// Header: magic, version, tag, body length (all little-endian).
const HEADER_BYTES: usize = 4 + 4 + 1 + 8;

/// Serialize and frame one message. Returns the total bytes written.
pub fn write_frame<M: Serialize>(
    writer: &mut impl Write,
    frame_type: FrameType,
    message: &M,
) -> Result<u64, ProtocolError> {
    let body = bincode::serialize(message)?;
    writer.write_all(&FRAME_MAGIC.to_le_bytes())?;
    writer.write_all(&PROTOCOL_VERSION.to_le_bytes())?;
    writer.write_all(&[frame_type as u8])?;
    writer.write_all(&(body.len() as u64).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(HEADER_BYTES as u64 + body.len() as u64)
}

/// Read one frame header, validating magic and exact version.
pub fn read_frame_header(reader: &mut impl Read) -> Result<(FrameType, u64), ProtocolError> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    if u32::from_le_bytes(word) != FRAME_MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    reader.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch { got: version, expected: PROTOCOL_VERSION });
    }
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let frame_type =
        FrameType::from_byte(tag[0]).ok_or(ProtocolError::UnknownFrameTag(tag[0]))?;
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let body_len = u64::from_le_bytes(len);
    if body_len > MAX_BODY_BYTES {
        return Err(ProtocolError::MalformedMessage(format!(
            "frame body of {body_len} bytes exceeds the limit"
        )));
    }
    Ok((frame_type, body_len))
}

/// Read and decode one frame body of a known length.
pub fn read_frame_body<M: DeserializeOwned>(
    reader: &mut impl Read,
    body_len: u64,
) -> Result<M, ProtocolError> {
    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

/// Total wire size of a frame with a body of `body_len` bytes.
#[inline]
pub fn frame_bytes(body_len: u64) -> u64 {
    HEADER_BYTES as u64 + body_len
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let msg = SenderOperation::Oprf(OprfRequest { data: vec![1, 2, 3, 4] });
        let mut buf = Vec::new();
        let written = write_frame(&mut buf, msg.frame_type(), &msg).unwrap();
        assert_eq!(written, buf.len() as u64);

        let mut cursor = buf.as_slice();
        let (frame_type, body_len) = read_frame_header(&mut cursor).unwrap();
        assert_eq!(frame_type, FrameType::SopOprf);
        let back: SenderOperation = read_frame_body(&mut cursor, body_len).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn version_is_compared_exactly() {
        let msg = SenderOperation::Parms;
        let mut buf = Vec::new();
        write_frame(&mut buf, msg.frame_type(), &msg).unwrap();
        // Corrupt the version field (bytes 4..8).
        buf[4] ^= 0x01;
        assert!(matches!(
            read_frame_header(&mut buf.as_slice()),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_and_unknown_tag_are_rejected() {
        let msg = SenderOperation::Parms;
        let mut buf = Vec::new();
        write_frame(&mut buf, msg.frame_type(), &msg).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            read_frame_header(&mut bad_magic.as_slice()),
            Err(ProtocolError::BadMagic)
        ));

        let mut bad_tag = buf;
        bad_tag[8] = 0xEE;
        assert!(matches!(
            read_frame_header(&mut bad_tag.as_slice()),
            Err(ProtocolError::UnknownFrameTag(0xEE))
        ));
    }

    #[test]
    fn truncated_stream_reads_as_channel_closed() {
        let msg = SenderOperation::Parms;
        let mut buf = Vec::new();
        write_frame(&mut buf, msg.frame_type(), &msg).unwrap();
        buf.truncate(6);
        assert!(matches!(
            read_frame_header(&mut buf.as_slice()),
            Err(ProtocolError::ChannelClosed)
        ));
    }
}
