//! Cursor-based reader/writer for command payloads.
//!
//! Writes append to the end of the buffer in big-endian order, reads advance
//! a separate read cursor. Reading past the end is an error, never a zero.

use crate::address::{Address, AddressWidth};
use crate::binary;
use snafu::{ensure, OptionExt, Snafu};

/// Default length of a fixed-width name.
pub const DEFAULT_NAME_LENGTH: usize = 5;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A pop needed more bytes than are left.
    #[snafu(display("Need {} bytes, {} left in stack", needed, available))]
    EndOfBuffer {
        /// Bytes required by the pop.
        needed: usize,
        /// Bytes left after the read cursor.
        available: usize,
    },
    /// Popped string bytes are not valid UTF-8.
    #[snafu(display("Invalid UTF-8 string"))]
    InvalidString,
    /// The value doesn't fit in its length prefix.
    #[snafu(display("Length {} exceeds maximum {}", len, max))]
    TooLong {
        /// Actual length.
        len: usize,
        /// Largest length the prefix can hold.
        max: usize,
    },
}

impl From<binary::Error> for Error {
    fn from(err: binary::Error) -> Self {
        match err {
            binary::Error::OutOfBounds {
                offset, len, size, ..
            } => Error::EndOfBuffer {
                needed: len,
                available: size.saturating_sub(offset),
            },
        }
    }
}

fn truncated(value: &str, max: usize) -> &str {
    let mut end = value.len().min(max);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Payload reader/writer.
///
/// ## Example
/// ```
/// use hbus_proto::ByteStack;
/// let mut stack = ByteStack::new();
/// stack.push_name("LS01");
/// stack.push_u16(500);
/// assert_eq!(stack.as_bytes(), b"LS01 \x01\xf4");
///
/// let mut reader = ByteStack::from_bytes(stack.into_bytes());
/// assert_eq!(reader.pop_name().unwrap(), "LS01");
/// assert_eq!(reader.pop_u16().unwrap(), 500);
/// assert!(reader.pop_u8().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ByteStack {
    data: Vec<u8>,
    read_pos: usize,
    name_length: usize,
}

impl ByteStack {
    /// Empty stack using [`DEFAULT_NAME_LENGTH`].
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Stack reading from `data`, cursor at the start.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            read_pos: 0,
            name_length: DEFAULT_NAME_LENGTH,
        }
    }

    /// Use names of `length` bytes instead of the default.
    pub fn with_name_length(mut self, length: usize) -> Self {
        self.name_length = length;
        self
    }

    /// Length of fixed-width names.
    pub fn name_length(&self) -> usize {
        self.name_length
    }

    /// Everything written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn write_position(&self) -> usize {
        self.data.len()
    }

    /// Bytes left to pop.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Rewind the read cursor.
    pub fn clear_read(&mut self) {
        self.read_pos = 0;
    }

    /// Drop all data and rewind.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    pub fn push_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn push_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn push_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn push_f32(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Push `address` using `width` bytes.
    pub fn push_address(&mut self, address: Address, width: AddressWidth) {
        self.data.extend_from_slice(&address.to_bytes(width));
    }

    /// Push a 16-bit length followed by the bytes. `None` and empty
    /// arrays are both written as length 0.
    /// # Errors
    /// Returns [`Error::TooLong`] for arrays over 65535 bytes.
    pub fn push_array(&mut self, array: Option<&[u8]>) -> Result<(), Error> {
        let array = array.unwrap_or_default();
        let len = u16::try_from(array.len()).ok().context(TooLongSnafu {
            len: array.len(),
            max: usize::from(u16::MAX),
        })?;
        self.push_u16(len);
        self.data.extend_from_slice(array);
        Ok(())
    }

    /// Push UTF-8 bytes and a terminating 0.
    pub fn push_str(&mut self, value: &str) {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
    }

    /// Push a name padded with spaces, or truncated, to the name length.
    pub fn push_name(&mut self, name: &str) {
        let mut bytes = truncated(name, self.name_length).as_bytes().to_vec();
        bytes.resize(self.name_length, b' ');
        self.data.extend_from_slice(&bytes);
    }

    /// Push a 1-byte count followed by that many names.
    pub fn push_names(&mut self, names: &[&str]) -> Result<(), Error> {
        self.push_count(names.len())?;
        for name in names {
            self.push_name(name);
        }
        Ok(())
    }

    /// Push a 1-byte count followed by that many null-terminated strings.
    pub fn push_string_array(&mut self, values: &[&str]) -> Result<(), Error> {
        self.push_count(values.len())?;
        for value in values {
            self.push_str(value);
        }
        Ok(())
    }

    /// Push a 1-byte length followed by at most `size` bytes of `value`.
    pub fn push_sized_str(&mut self, value: &str, size: usize) -> Result<(), Error> {
        let bytes = truncated(value, size).as_bytes();
        self.push_count(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Push a 1-byte count followed by that many sized strings.
    pub fn push_sized_strs(&mut self, values: &[&str], size: usize) -> Result<(), Error> {
        self.rewind_on_error(|stack| {
            stack.push_count(values.len())?;
            for value in values {
                stack.push_sized_str(value, size)?;
            }
            Ok(())
        })
    }

    fn push_count(&mut self, count: usize) -> Result<(), Error> {
        let count = u8::try_from(count).ok().context(TooLongSnafu {
            len: count,
            max: usize::from(u8::MAX),
        })?;
        self.push_u8(count);
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], Error> {
        let available = self.remaining();
        ensure!(
            len <= available,
            EndOfBufferSnafu {
                needed: len,
                available
            }
        );
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..self.read_pos])
    }

    pub fn pop_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn pop_u16(&mut self) -> Result<u16, Error> {
        let value = binary::read_u16(&self.data, self.read_pos)?;
        self.read_pos += 2;
        Ok(value)
    }

    pub fn pop_i16(&mut self) -> Result<i16, Error> {
        let value = binary::read_i16(&self.data, self.read_pos)?;
        self.read_pos += 2;
        Ok(value)
    }

    pub fn pop_u32(&mut self) -> Result<u32, Error> {
        let value = binary::read_u32(&self.data, self.read_pos)?;
        self.read_pos += 4;
        Ok(value)
    }

    pub fn pop_i32(&mut self) -> Result<i32, Error> {
        let value = binary::read_i32(&self.data, self.read_pos)?;
        self.read_pos += 4;
        Ok(value)
    }

    pub fn pop_f32(&mut self) -> Result<f32, Error> {
        let value = binary::read_f32(&self.data, self.read_pos)?;
        self.read_pos += 4;
        Ok(value)
    }

    /// Pop an address of `width` bytes.
    pub fn pop_address(&mut self, width: AddressWidth) -> Result<Address, Error> {
        let bytes = self.take(width.bytes())?;
        // take() already checked the length
        Ok(Address::from_bytes(bytes, 0, width).unwrap_or_default())
    }

    /// Pop a length-prefixed array. A stored length of 0 is `None`.
    pub fn pop_array(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.rewind_on_error(|stack| {
            let len = stack.pop_u16()?;
            if len == 0 {
                return Ok(None);
            }
            Ok(Some(stack.take(len.into())?.to_vec()))
        })
    }

    /// Pop a string up to a 0 byte or the end of the buffer.
    pub fn pop_str(&mut self) -> Result<String, Error> {
        ensure!(
            self.remaining() > 0,
            EndOfBufferSnafu {
                needed: 1usize,
                available: 0usize
            }
        );
        let rest = &self.data[self.read_pos..];
        let (len, consumed) = match rest.iter().position(|b| *b == 0) {
            Some(nul) => (nul, nul + 1),
            None => (rest.len(), rest.len()),
        };
        let value = std::str::from_utf8(&rest[..len])
            .ok()
            .map(str::to_owned)
            .ok_or(Error::InvalidString)?;
        self.read_pos += consumed;
        Ok(value)
    }

    /// Pop a fixed-width name, trimmed.
    pub fn pop_name(&mut self) -> Result<String, Error> {
        let len = self.name_length;
        let bytes = self.take(len)?;
        let name = String::from_utf8_lossy(bytes);
        Ok(name.trim().to_owned())
    }

    /// Pop a 1-byte count followed by that many names.
    pub fn pop_names(&mut self) -> Result<Vec<String>, Error> {
        self.rewind_on_error(|stack| {
            let count = stack.pop_u8()?;
            (0..count).map(|_| stack.pop_name()).collect()
        })
    }

    /// Pop a 1-byte count followed by that many null-terminated strings.
    pub fn pop_string_array(&mut self) -> Result<Vec<String>, Error> {
        self.rewind_on_error(|stack| {
            let count = stack.pop_u8()?;
            (0..count).map(|_| stack.pop_str()).collect()
        })
    }

    /// Pop a 1-byte length-prefixed string. A stored length of 0 is `None`.
    pub fn pop_sized_str(&mut self) -> Result<Option<String>, Error> {
        self.rewind_on_error(|stack| {
            let len = stack.pop_u8()?;
            if len == 0 {
                return Ok(None);
            }
            let bytes = stack.take(len.into())?;
            let value = std::str::from_utf8(bytes)
                .map(str::to_owned)
                .ok()
                .ok_or(Error::InvalidString)?;
            Ok(Some(value))
        })
    }

    /// Pop a 1-byte count followed by that many sized strings.
    pub fn pop_sized_strs(&mut self) -> Result<Vec<String>, Error> {
        self.rewind_on_error(|stack| {
            let count = stack.pop_u8()?;
            (0..count)
                .map(|_| stack.pop_sized_str().map(Option::unwrap_or_default))
                .collect()
        })
    }

    /// Run `op`, restoring both cursors if it fails part way.
    fn rewind_on_error<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let (read_pos, write_pos) = (self.read_pos, self.data.len());
        let result = op(self);
        if result.is_err() {
            self.read_pos = read_pos;
            self.data.truncate(write_pos);
        }
        result
    }
}

impl Default for ByteStack {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for ByteStack {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<ByteStack> for Vec<u8> {
    fn from(stack: ByteStack) -> Self {
        stack.data
    }
}
