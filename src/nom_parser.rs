use nom::bytes::streaming::take;
use nom::combinator::{consumed, verify};
use nom::number::streaming::{be_u16, be_u8};
use nom::IResult;

use crate::address::{Address, AddressWidth};
use crate::binary::crc16;
use crate::message::{LengthClass, START_BYTE};

type Buf = [u8];
type Res<'a, T> = IResult<&'a Buf, T>;

/// One frame as found on the wire, payload still borrowed from the input.
#[derive(PartialEq, Debug, Clone)]
pub(crate) struct RawFrame<'a> {
    pub flags: u8,
    pub destination: Address,
    pub source: Address,
    pub command: u8,
    pub payload: &'a Buf,
    pub crc: u16,
    /// CRC over everything before the CRC field
    pub computed_crc: u16,
}

pub(crate) fn frame(buf: &Buf) -> Res<'_, RawFrame<'_>> {
    let (buf, (covered, body)) = consumed(frame_body)(buf)?;
    let (buf, crc) = word(buf)?;
    let (flags, destination, source, command, payload) = body;
    Ok((
        buf,
        RawFrame {
            flags,
            destination,
            source,
            command,
            payload,
            crc,
            computed_crc: crc16(covered),
        },
    ))
}

type Body<'a> = (u8, Address, Address, u8, &'a Buf);

fn frame_body(buf: &Buf) -> Res<'_, Body<'_>> {
    let (buf, _start) = verify(byte, |b: &u8| *b == START_BYTE)(buf)?;
    let (buf, flags) = byte(buf)?;
    let (buf, len) = match LengthClass::from_flags(flags).fixed_length() {
        Some(len) => (buf, len),
        None => {
            let (buf, len) = word(buf)?;
            (buf, usize::from(len))
        }
    };
    let width = AddressWidth::from_flags(flags);
    let (buf, destination) = address(width, buf)?;
    let (buf, source) = address(width, buf)?;
    let (buf, command) = byte(buf)?;
    let (buf, payload) = bytes(len, buf)?;
    Ok((buf, (flags, destination, source, command, payload)))
}

fn address(width: AddressWidth, buf: &Buf) -> Res<'_, Address> {
    let (buf, raw) = bytes(width.bytes(), buf)?;
    // length is guaranteed by take()
    let address = Address::from_bytes(raw, 0, width).unwrap_or_default();
    Ok((buf, address))
}

fn byte(buf: &Buf) -> Res<'_, u8> {
    be_u8(buf)
}

fn word(buf: &Buf) -> Res<'_, u16> {
    be_u16(buf)
}

fn bytes(len: usize, buf: &Buf) -> Res<'_, &Buf> {
    take(len)(buf)
}
