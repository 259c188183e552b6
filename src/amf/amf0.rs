//! AMF0 encoder and decoder
//!
//! AMF0 is the original Action Message Format used in Flash/RTMP. Only the
//! subset exchanged by the publishing dialogue is implemented here.
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double, big-endian)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x08 - ECMA Array (element count + key-value pairs until 0x000009)
//! 0x09 - Object End (terminal byte of the 0x000009 sequence)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```
//!
//! Property keys inside objects and arrays are written bare: a 16-bit length
//! followed by the bytes, with no type marker.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    EcmaArray,
}

/// AMF0 encoder
///
/// A small builder over a growing buffer. Inside an object or ECMA array the
/// encoder alternates between property keys and values; writing a value where
/// a key is due (or the reverse) is rejected, as is finishing with an
/// unterminated container.
pub struct Amf0Encoder {
    buf: BytesMut,
    containers: Vec<Container>,
    needs_key: bool,
}

impl Amf0Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            containers: Vec::new(),
            needs_key: false,
        }
    }

    /// Get current encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if encoder is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes, verifying all containers are closed
    pub fn finish(&mut self) -> Result<Bytes, AmfError> {
        if !self.containers.is_empty() {
            return Err(AmfError::UnbalancedObject);
        }
        Ok(self.buf.split().freeze())
    }

    /// Encode a Number (any numeric value travels as an IEEE-754 double)
    pub fn number(&mut self, value: f64) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        self.buf.put_u8(MARKER_NUMBER);
        self.buf.put_f64(value);
        self.after_value();
        Ok(self)
    }

    /// Encode a Boolean
    pub fn boolean(&mut self, value: bool) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        self.buf.put_u8(MARKER_BOOLEAN);
        self.buf.put_u8(value as u8);
        self.after_value();
        Ok(self)
    }

    /// Encode a String (or LongString when longer than 65535 bytes)
    pub fn string(&mut self, value: &str) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        if value.len() > u16::MAX as usize {
            self.buf.put_u8(MARKER_LONG_STRING);
            self.buf.put_u32(value.len() as u32);
        } else {
            self.buf.put_u8(MARKER_STRING);
            self.buf.put_u16(value.len() as u16);
        }
        self.buf.put_slice(value.as_bytes());
        self.after_value();
        Ok(self)
    }

    /// Encode a Null
    pub fn null(&mut self) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        self.buf.put_u8(MARKER_NULL);
        self.after_value();
        Ok(self)
    }

    /// Write a bare property key; the next call must encode its value
    pub fn property(&mut self, key: &str) -> Result<&mut Self, AmfError> {
        if !self.needs_key {
            return Err(AmfError::ValueExpected);
        }
        let len = key.len().min(u16::MAX as usize);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&key.as_bytes()[..len]);
        self.needs_key = false;
        Ok(self)
    }

    /// Start an Object
    pub fn begin_object(&mut self) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        self.buf.put_u8(MARKER_OBJECT);
        self.containers.push(Container::Object);
        self.needs_key = true;
        Ok(self)
    }

    /// Terminate the innermost Object
    pub fn end_object(&mut self) -> Result<&mut Self, AmfError> {
        self.end_container(Container::Object)
    }

    /// Start an ECMA array with the given element count
    pub fn begin_ecma_array(&mut self, count: u32) -> Result<&mut Self, AmfError> {
        self.check_value_position()?;
        self.buf.put_u8(MARKER_ECMA_ARRAY);
        self.buf.put_u32(count);
        self.containers.push(Container::EcmaArray);
        self.needs_key = true;
        Ok(self)
    }

    /// Terminate the innermost ECMA array
    pub fn end_array(&mut self) -> Result<&mut Self, AmfError> {
        self.end_container(Container::EcmaArray)
    }

    fn end_container(&mut self, expected: Container) -> Result<&mut Self, AmfError> {
        if self.containers.last() != Some(&expected) {
            return Err(AmfError::UnbalancedObject);
        }
        if !self.needs_key {
            // A property key is dangling without its value
            return Err(AmfError::ValueExpected);
        }
        self.containers.pop();
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
        self.needs_key = !self.containers.is_empty();
        Ok(self)
    }

    fn check_value_position(&self) -> Result<(), AmfError> {
        if self.needs_key {
            return Err(AmfError::KeyExpected);
        }
        Ok(())
    }

    fn after_value(&mut self) {
        self.needs_key = !self.containers.is_empty();
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// AMF0 decoder
///
/// A read cursor over a received payload. Every getter checks the type
/// marker first and consumes nothing on a mismatch or on a short buffer, so
/// callers can probe for one type and fall back to another.
pub struct Amf0Decoder {
    buf: Bytes,
    pos: usize,
}

impl Amf0Decoder {
    /// Create a decoder over a message payload
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload, pos: 0 }
    }

    /// Bytes left to decode
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Check whether any bytes are left
    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Peek at the next type marker
    pub fn peek_marker(&self) -> Result<u8, AmfError> {
        self.buf.get(self.pos).copied().ok_or(AmfError::UnexpectedEof)
    }

    /// Read a Number
    pub fn number(&mut self) -> Result<f64, AmfError> {
        self.expect_marker(MARKER_NUMBER, 9)?;
        let raw = u64::from_be_bytes(self.fixed::<8>(self.pos + 1));
        self.pos += 9;
        Ok(f64::from_bits(raw))
    }

    /// Read a Boolean
    pub fn boolean(&mut self) -> Result<bool, AmfError> {
        self.expect_marker(MARKER_BOOLEAN, 2)?;
        let value = self.buf[self.pos + 1] != 0;
        self.pos += 2;
        Ok(value)
    }

    /// Read a tagged String or LongString
    pub fn string(&mut self) -> Result<String, AmfError> {
        let marker = self.peek_marker()?;
        let (len, data_start) = match marker {
            MARKER_STRING => {
                self.need(3)?;
                let len = u16::from_be_bytes(self.fixed::<2>(self.pos + 1)) as usize;
                (len, self.pos + 3)
            }
            MARKER_LONG_STRING => {
                self.need(5)?;
                let len = u32::from_be_bytes(self.fixed::<4>(self.pos + 1)) as usize;
                (len, self.pos + 5)
            }
            found => {
                return Err(AmfError::TypeMismatch { expected: MARKER_STRING, found });
            }
        };
        if data_start + len > self.buf.len() {
            return Err(AmfError::UnexpectedEof);
        }
        let s = std::str::from_utf8(&self.buf[data_start..data_start + len])
            .map_err(|_| AmfError::InvalidUtf8)?
            .to_owned();
        self.pos = data_start + len;
        Ok(s)
    }

    /// Read a bare property key (no type marker)
    ///
    /// An empty key signals that the object terminator follows.
    pub fn property_key(&mut self) -> Result<String, AmfError> {
        self.need(2)?;
        let len = u16::from_be_bytes(self.fixed::<2>(self.pos)) as usize;
        if self.pos + 2 + len > self.buf.len() {
            return Err(AmfError::UnexpectedEof);
        }
        let s = std::str::from_utf8(&self.buf[self.pos + 2..self.pos + 2 + len])
            .map_err(|_| AmfError::InvalidUtf8)?
            .to_owned();
        self.pos += 2 + len;
        Ok(s)
    }

    /// Read a Null
    pub fn null(&mut self) -> Result<(), AmfError> {
        self.expect_marker(MARKER_NULL, 1)?;
        self.pos += 1;
        Ok(())
    }

    /// Read an Object start marker
    pub fn object_start(&mut self) -> Result<(), AmfError> {
        self.expect_marker(MARKER_OBJECT, 1)?;
        self.pos += 1;
        Ok(())
    }

    /// Read the three-byte object terminator
    pub fn object_end(&mut self) -> Result<(), AmfError> {
        self.need(3)?;
        let bytes = &self.buf[self.pos..self.pos + 3];
        if bytes != [0, 0, MARKER_OBJECT_END] {
            return Err(AmfError::TypeMismatch {
                expected: MARKER_OBJECT_END,
                found: bytes[2],
            });
        }
        self.pos += 3;
        Ok(())
    }

    /// Consume one value of whatever scalar type comes next
    ///
    /// Composite values (objects, arrays, dates, ...) cannot be skipped
    /// without a full parse and are reported as unsupported; the caller must
    /// drain them explicitly.
    pub fn skip_value(&mut self) -> Result<(), AmfError> {
        match self.peek_marker()? {
            MARKER_NUMBER => self.number().map(|_| ()),
            MARKER_BOOLEAN => self.boolean().map(|_| ()),
            MARKER_STRING | MARKER_LONG_STRING => self.string().map(|_| ()),
            MARKER_NULL => self.null(),
            tag => Err(AmfError::UnsupportedValue(tag)),
        }
    }

    /// Read the leading (command name, transaction id) pair of a command
    pub fn command_name(&mut self) -> Result<(String, f64), AmfError> {
        let name = self.string()?;
        let id = self.number()?;
        Ok((name, id))
    }

    fn expect_marker(&self, marker: u8, total_len: usize) -> Result<(), AmfError> {
        self.need(total_len)?;
        let found = self.buf[self.pos];
        if found != marker {
            return Err(AmfError::TypeMismatch { expected: marker, found });
        }
        Ok(())
    }

    fn need(&self, len: usize) -> Result<(), AmfError> {
        if self.pos + len > self.buf.len() {
            return Err(AmfError::UnexpectedEof);
        }
        Ok(())
    }

    fn fixed<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[at..at + N]);
        out
    }
}
