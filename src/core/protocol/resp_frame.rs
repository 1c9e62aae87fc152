// src/core/protocol/resp_frame.rs

//! The RESP (REdis Serialization Protocol) frame type and its `tokio_util` codec.
//!
//! The transport only needs the RESP2 subset: requests are arrays of bulk strings,
//! replies are any of the five RESP2 types, and pub/sub deliveries arrive as
//! unsolicited arrays on a subscribed session.

use crate::core::SyncError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits guarding against a misbehaving broker.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 64;

/// A single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a request frame: an array of bulk strings.
    pub fn command<I, A>(parts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|part| RespFrame::BulkString(part.into()))
                .collect(),
        )
    }

    /// Returns the bytes of a bulk or simple string frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Turns an error reply into `Err`, passing every other frame through.
    pub fn into_result(self) -> Result<RespFrame, SyncError> {
        match self {
            RespFrame::Error(message) => Err(SyncError::from_error_reply(&message)),
            other => Ok(other),
        }
    }

    /// Encodes the frame into a standalone byte vector.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = SyncError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_frame(&mut bytes, 0) {
            Ok(frame) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // Wait for more bytes from the socket.
            Err(SyncError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode_frame(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, SyncError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(SyncError::Protocol("reply nesting too deep".into()));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(SyncError::IncompleteData);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(
            String::from_utf8_lossy(read_line(bytes)?).into_owned(),
        )),
        b'-' => Ok(RespFrame::Error(
            String::from_utf8_lossy(read_line(bytes)?).into_owned(),
        )),
        b':' => Ok(RespFrame::Integer(read_number(bytes)?)),
        b'$' => {
            let len = read_number(bytes)?;
            if len == -1 {
                return Ok(RespFrame::Null);
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= MAX_BULK_STRING_SIZE)
                .ok_or(SyncError::SyntaxError)?;
            if bytes.len() < len + CRLF_LEN {
                return Err(SyncError::IncompleteData);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(SyncError::SyntaxError);
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = read_number(bytes)?;
            if len == -1 {
                return Ok(RespFrame::NullArray);
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= MAX_FRAME_ELEMENTS)
                .ok_or(SyncError::SyntaxError)?;
            let mut frames = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                frames.push(decode_frame(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(frames))
        }
        other => Err(SyncError::Protocol(format!(
            "unexpected type byte 0x{other:02x}"
        ))),
    }
}

/// Returns the next CRLF-terminated line and advances past it.
fn read_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], SyncError> {
    let pos = bytes
        .windows(CRLF_LEN)
        .position(|window| window == CRLF)
        .ok_or(SyncError::IncompleteData)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn read_number(bytes: &mut &[u8]) -> Result<i64, SyncError> {
    let line = read_line(bytes)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(SyncError::SyntaxError)
}
