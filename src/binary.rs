//! Big-endian conversions and the CRC used on the wire.
//!
//! All readers take a buffer and an offset and fail with
//! [`Error::OutOfBounds`] instead of reading past the end.

use crc::{Crc, CRC_16_XMODEM};
use snafu::{OptionExt, Snafu};

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The requested range doesn't fit in the buffer.
    #[snafu(display("{} bytes at offset {} exceed buffer of {} bytes", len, offset, size))]
    OutOfBounds {
        /// Start of the requested range.
        offset: usize,
        /// Length of the requested range.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },
}

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XModem: polynomial 0x1021, init 0, no reflection, no final xor.
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], Error> {
    let size = buf.len();
    let context = || OutOfBoundsSnafu {
        offset,
        len: N,
        size,
    };
    let end = offset.checked_add(N).with_context(context)?;
    let bytes = buf.get(offset..end).with_context(context)?;
    let mut out = [0; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn field_mut<const N: usize>(buf: &mut [u8], offset: usize) -> Result<&mut [u8], Error> {
    let size = buf.len();
    let context = || OutOfBoundsSnafu {
        offset,
        len: N,
        size,
    };
    let end = offset.checked_add(N).with_context(context)?;
    buf.get_mut(offset..end).with_context(context)
}

/// Read a big-endian `u16` at `offset`.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, Error> {
    field(buf, offset).map(u16::from_be_bytes)
}

/// Read a big-endian `i16` at `offset`.
pub fn read_i16(buf: &[u8], offset: usize) -> Result<i16, Error> {
    field(buf, offset).map(i16::from_be_bytes)
}

/// Read a big-endian `u32` at `offset`.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, Error> {
    field(buf, offset).map(u32::from_be_bytes)
}

/// Read a big-endian `i32` at `offset`.
pub fn read_i32(buf: &[u8], offset: usize) -> Result<i32, Error> {
    field(buf, offset).map(i32::from_be_bytes)
}

/// Read a big-endian IEEE-754 `f32` at `offset`.
pub fn read_f32(buf: &[u8], offset: usize) -> Result<f32, Error> {
    field(buf, offset).map(f32::from_be_bytes)
}

/// Write `value` big-endian at `offset`.
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), Error> {
    field_mut::<2>(buf, offset)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write `value` big-endian at `offset`.
pub fn write_i16(buf: &mut [u8], offset: usize, value: i16) -> Result<(), Error> {
    field_mut::<2>(buf, offset)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write `value` big-endian at `offset`.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), Error> {
    field_mut::<4>(buf, offset)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write `value` big-endian at `offset`.
pub fn write_i32(buf: &mut [u8], offset: usize, value: i32) -> Result<(), Error> {
    field_mut::<4>(buf, offset)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write `value` big-endian at `offset`.
pub fn write_f32(buf: &mut [u8], offset: usize, value: f32) -> Result<(), Error> {
    field_mut::<4>(buf, offset)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
