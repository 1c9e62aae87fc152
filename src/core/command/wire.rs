// src/core/command/wire.rs

//! Primitive field encoding shared by command frames and channel envelopes.
//!
//! Strings are a u16 big-endian byte length followed by UTF-8 bytes, doubles and
//! integers are fixed-width big-endian, booleans are a single byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The longest string a u16 length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Failures while building or reading a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("unknown command tag '{0}'")]
    UnknownTag(String),

    #[error("frame ended while reading {field}: needed {needed} byte(s), {remaining} left")]
    Underrun {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} is {len} bytes, over the {MAX_STRING_LEN} byte string limit")]
    StringTooLong { field: &'static str, len: usize },
}

/// Appends fields to a frame under construction.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_str(&mut self, field: &'static str, value: &str) -> Result<(), CodecError> {
        let len = value.len();
        if len > MAX_STRING_LEN {
            return Err(CodecError::StringTooLong { field, len });
        }
        self.buf.put_u16(len as u16);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads fields off the front of a frame. Every read either consumes exactly
/// the field or fails without producing a value.
#[derive(Debug)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// The unread tail of the frame.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), CodecError> {
        if self.buf.len() < needed {
            return Err(CodecError::Underrun {
                field,
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_str(&mut self, field: &'static str) -> Result<String, CodecError> {
        self.ensure(field, 2)?;
        let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
        self.ensure(field, 2 + len)?;
        let value = std::str::from_utf8(&self.buf[2..2 + len])
            .map_err(|_| CodecError::InvalidUtf8 { field })?
            .to_owned();
        self.buf.advance(2 + len);
        Ok(value)
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, CodecError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8() != 0)
    }

    pub fn read_f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64())
    }
}
