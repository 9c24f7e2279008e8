//! Binary message codec
//!
//! Frame payload layout (the length prefix is added by the transport):
//!
//! ```text
//! byte 0    protocol version
//! byte 1    variant tag
//! byte 2..  MessagePack body of the variant (empty for Ping/Pong)
//! ```
//!
//! The leading tag makes every payload self-describing; unknown tags are
//! reported as [`ProtocolError::UnknownTag`] so newer backends can add
//! variants without breaking older clients.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{
    BackendError, GenerateBatchRequest, GenerateRequest, JobAccepted, JobComplete, JobFailed,
    JobProgress, JobRef, PROTOCOL_VERSION, Request, Response,
};
use crate::domain::batch::MAX_BATCH_SIZE;

const HEADER_LEN: usize = 2;

mod tag {
    pub const GENERATE: u8 = 0x01;
    pub const GENERATE_BATCH: u8 = 0x02;
    pub const CANCEL: u8 = 0x03;
    pub const STATUS: u8 = 0x04;
    pub const PING: u8 = 0x05;

    pub const ACCEPTED: u8 = 0x81;
    pub const PROGRESS: u8 = 0x82;
    pub const COMPLETE: u8 = 0x83;
    pub const FAILED: u8 = 0x84;
    pub const CANCELLED: u8 = 0x85;
    pub const PONG: u8 = 0x86;
    pub const ERROR: u8 = 0x87;
}

/// Errors raised while encoding or decoding a frame payload
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is corrupt, truncated or violates a message constraint
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Payload was written by an incompatible protocol version
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Variant tag this side does not know about
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Message could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

/// A message family that can be written to and read from the wire
pub trait WireMessage: Sized {
    /// Variant tag written in the header
    fn tag(&self) -> u8;

    /// Appends the MessagePack body of this message to `buf`
    fn write_body(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError>;

    /// Rebuilds a message from its tag and body
    fn read_body(tag: u8, body: &[u8]) -> Result<Self, ProtocolError>;
}

/// Encodes a message into a frame payload
pub fn encode<M: WireMessage>(message: &M) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    buf.push(PROTOCOL_VERSION);
    buf.push(message.tag());
    message.write_body(&mut buf)?;
    Ok(buf)
}

/// Decodes a frame payload into a message
pub fn decode<M: WireMessage>(payload: &[u8]) -> Result<M, ProtocolError> {
    if payload.len() < HEADER_LEN {
        return Err(ProtocolError::malformed(format!(
            "payload of {} byte(s) is shorter than the header",
            payload.len()
        )));
    }

    let version = payload[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    M::read_body(payload[1], &payload[HEADER_LEN..])
}

fn write<T: Serialize>(buf: &mut Vec<u8>, body: &T) -> Result<(), ProtocolError> {
    rmp_serde::encode::write_named(buf, body).map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn read<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn expect_empty(tag: u8, body: &[u8]) -> Result<(), ProtocolError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::malformed(format!(
            "tag 0x{tag:02x} carries no body but {} byte(s) followed",
            body.len()
        )))
    }
}

impl WireMessage for Request {
    fn tag(&self) -> u8 {
        match self {
            Request::Generate(_) => tag::GENERATE,
            Request::GenerateBatch(_) => tag::GENERATE_BATCH,
            Request::Cancel(_) => tag::CANCEL,
            Request::Status(_) => tag::STATUS,
            Request::Ping => tag::PING,
        }
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Request::Generate(body) => write(buf, body),
            Request::GenerateBatch(body) => {
                check_batch_len(body.entries.len())?;
                write(buf, body)
            }
            Request::Cancel(body) | Request::Status(body) => write(buf, body),
            Request::Ping => Ok(()),
        }
    }

    fn read_body(tag: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            tag::GENERATE => read::<GenerateRequest>(body).map(Request::Generate),
            tag::GENERATE_BATCH => {
                let batch: GenerateBatchRequest = read(body)?;
                check_batch_len(batch.entries.len())?;
                Ok(Request::GenerateBatch(batch))
            }
            tag::CANCEL => read::<JobRef>(body).map(Request::Cancel),
            tag::STATUS => read::<JobRef>(body).map(Request::Status),
            tag::PING => expect_empty(tag, body).map(|_| Request::Ping),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

impl WireMessage for Response {
    fn tag(&self) -> u8 {
        match self {
            Response::Accepted(_) => tag::ACCEPTED,
            Response::Progress(_) => tag::PROGRESS,
            Response::Complete(_) => tag::COMPLETE,
            Response::Failed(_) => tag::FAILED,
            Response::Cancelled(_) => tag::CANCELLED,
            Response::Pong => tag::PONG,
            Response::Error(_) => tag::ERROR,
        }
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Response::Accepted(body) => write(buf, body),
            Response::Progress(body) => write(buf, body),
            Response::Complete(body) => write(buf, body),
            Response::Failed(body) => write(buf, body),
            Response::Cancelled(body) => write(buf, body),
            Response::Pong => Ok(()),
            Response::Error(body) => write(buf, body),
        }
    }

    fn read_body(tag: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        match tag {
            tag::ACCEPTED => read::<JobAccepted>(body).map(Response::Accepted),
            tag::PROGRESS => read::<JobProgress>(body).map(Response::Progress),
            tag::COMPLETE => read::<JobComplete>(body).map(Response::Complete),
            tag::FAILED => read::<JobFailed>(body).map(Response::Failed),
            tag::CANCELLED => read::<JobRef>(body).map(Response::Cancelled),
            tag::PONG => expect_empty(tag, body).map(|_| Response::Pong),
            tag::ERROR => read::<BackendError>(body).map(Response::Error),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn check_batch_len(len: usize) -> Result<(), ProtocolError> {
    if len == 0 || len > MAX_BATCH_SIZE {
        return Err(ProtocolError::malformed(format!(
            "batch must hold 1..={MAX_BATCH_SIZE} entries, got {len}"
        )));
    }
    Ok(())
}
