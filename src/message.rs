//! The HBus frame and its codec.
//!
//! ```text
//! START FLAGS [LEN_HI LEN_LO] DEST.. SRC.. COMMAND PAYLOAD.. CRC_HI CRC_LO
//!
//! FLAGS  7..4 payload-length class
//!        3..2 address width (none, 1, 2 or 4 bytes)
//!        1..0 message type
//! ```
//!
//! `LEN` is only present for the user-defined length class. The CRC covers
//! every byte from START to the end of the payload.

use core::fmt;

use nom::Needed;
use snafu::{ensure, OptionExt, Snafu};

use crate::address::{Address, AddressWidth};
use crate::binary::crc16;
use crate::nom_parser;

/// First byte of every frame.
pub const START_BYTE: u8 = 0xAA;

/// Start, flags, command and CRC.
pub const MIN_FRAME_LEN: usize = 5;

/// Largest payload the explicit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Default limit on a frame waiting in a stream receive buffer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Error type for frame decoding.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// The buffer doesn't start with [`START_BYTE`].
    #[snafu(display("Expected start byte, found {:#04x}", found))]
    BadStart {
        /// The byte found instead.
        found: u8,
    },
    /// The buffer ends before the frame does.
    #[snafu(display("Truncated frame, {} more bytes needed", needed))]
    Truncated {
        /// Lower bound on the missing bytes.
        needed: usize,
    },
    /// The frame CRC doesn't match its content.
    #[snafu(display(
        "CRC mismatch: received {:#06x}, computed {:#06x}",
        received,
        computed
    ))]
    BadCrc {
        /// CRC carried by the frame.
        received: u16,
        /// CRC computed over the frame.
        computed: u16,
        /// Length of the rejected frame.
        len: usize,
    },
    /// The frame uses addresses of a different width than this codec.
    #[snafu(display("Address width {:?} doesn't match configured {:?}", found, expected))]
    WidthMismatch {
        /// Width configured in the codec.
        expected: AddressWidth,
        /// Width encoded in the frame.
        found: AddressWidth,
        /// Length of the rejected frame.
        len: usize,
    },
    /// The payload doesn't fit the explicit length field.
    #[snafu(display("Payload of {} bytes exceeds {} bytes", len, MAX_PAYLOAD_LEN))]
    PayloadTooLong {
        /// Payload length.
        len: usize,
    },
}

impl FrameError {
    /// Length of a complete but rejected frame, if known.
    pub fn frame_len(&self) -> Option<usize> {
        match self {
            Self::BadCrc { len, .. } | Self::WidthMismatch { len, .. } => Some(*len),
            _ => None,
        }
    }
}

/// Message type, the low two bits of the flags byte.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Command expecting an ACK or NACK.
    Normal = 0,
    /// Command without acknowledgment.
    Immediate = 1,
    /// Positive acknowledgment.
    AckResponse = 2,
    /// Negative acknowledgment, payload is the error code.
    NackResponse = 3,
}

impl MessageType {
    pub(crate) const FLAG_MASK: u8 = 0x03;

    pub const fn from_flags(flags: u8) -> Self {
        match flags & Self::FLAG_MASK {
            0 => Self::Normal,
            1 => Self::Immediate,
            2 => Self::AckResponse,
            _ => Self::NackResponse,
        }
    }

    /// ACK or NACK.
    pub const fn is_ack(self) -> bool {
        matches!(self, Self::AckResponse | Self::NackResponse)
    }

    /// Normal or immediate.
    pub const fn is_command(self) -> bool {
        !self.is_ack()
    }
}

/// Payload-length class, the high nibble of the flags byte.
///
/// Lengths 0 to 8 are encoded directly, powers of two from 16 to 512 have
/// their own codes, everything else is user-defined and carries two explicit
/// length bytes after the flags.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct LengthClass(u8);

impl LengthClass {
    pub(crate) const FLAG_MASK: u8 = 0xF0;
    /// Explicit 16-bit length follows the flags byte.
    pub const USER_DEFINED: Self = Self(0xF0);

    const FIXED: [(u8, usize); 6] = [
        (0x90, 16),
        (0xA0, 32),
        (0xB0, 64),
        (0xC0, 128),
        (0xD0, 256),
        (0xE0, 512),
    ];

    /// Class for a payload of `len` bytes.
    pub fn for_length(len: usize) -> Self {
        if len <= 8 {
            // fits in the nibble
            return Self((len as u8) << 4);
        }
        Self::FIXED
            .iter()
            .find(|(_, fixed)| *fixed == len)
            .map_or(Self::USER_DEFINED, |(code, _)| Self(*code))
    }

    pub const fn from_flags(flags: u8) -> Self {
        Self(flags & Self::FLAG_MASK)
    }

    pub const fn flag_bits(self) -> u8 {
        self.0
    }

    pub const fn is_user_defined(self) -> bool {
        self.0 == Self::USER_DEFINED.0
    }

    /// Payload length implied by the class, `None` when user-defined.
    pub fn fixed_length(self) -> Option<usize> {
        if self.0 <= 0x80 {
            return Some(usize::from(self.0 >> 4));
        }
        Self::FIXED
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, len)| *len)
    }
}

/// One HBus frame.
///
/// Messages built for sending get their CRC at serialization time; messages
/// parsed from the wire keep the CRC they arrived with, so forwarding them
/// reproduces the received bytes. Equality ignores the CRC.
#[derive(Debug, Clone, Eq)]
pub struct Message {
    flags: u8,
    destination: Address,
    source: Address,
    command: u8,
    payload: Vec<u8>,
    crc: Option<u16>,
}

impl Message {
    /// Build a message for sending with addresses of `width` bytes.
    ///
    /// If either address is [`Address::EMPTY`] the frame is sent without
    /// addresses and both endpoints become empty.
    ///
    /// # Example
    /// ```
    /// use hbus_proto::{Address, AddressWidth, Message, MessageType};
    /// let msg = Message::new(
    ///     MessageType::Normal,
    ///     Address::EMPTY,
    ///     Address::new(5),
    ///     0xE0,
    ///     vec![],
    ///     AddressWidth::One,
    /// );
    /// assert_eq!(msg.address_width(), AddressWidth::None);
    /// assert_eq!(msg.source(), Address::EMPTY);
    /// ```
    pub fn new(
        kind: MessageType,
        destination: Address,
        source: Address,
        command: u8,
        payload: impl Into<Vec<u8>>,
        width: AddressWidth,
    ) -> Self {
        let payload = payload.into();
        let width = if destination.is_empty() || source.is_empty() {
            AddressWidth::None
        } else {
            width
        };
        let (destination, source) = match width {
            AddressWidth::None => (Address::EMPTY, Address::EMPTY),
            _ => (destination, source),
        };
        let flags =
            LengthClass::for_length(payload.len()).flag_bits() | width.flag_bits() | kind as u8;
        Self {
            flags,
            destination,
            source,
            command,
            payload,
            crc: None,
        }
    }

    pub(crate) fn from_raw(raw: &nom_parser::RawFrame<'_>) -> Self {
        Self {
            flags: raw.flags,
            destination: raw.destination,
            source: raw.source,
            command: raw.command,
            payload: raw.payload.to_vec(),
            crc: Some(raw.crc),
        }
    }

    pub const fn flags(&self) -> u8 {
        self.flags
    }

    pub const fn kind(&self) -> MessageType {
        MessageType::from_flags(self.flags)
    }

    pub const fn address_width(&self) -> AddressWidth {
        AddressWidth::from_flags(self.flags)
    }

    pub const fn length_class(&self) -> LengthClass {
        LengthClass::from_flags(self.flags)
    }

    /// False for point-to-point frames without addresses.
    pub fn is_addressed(&self) -> bool {
        self.address_width() != AddressWidth::None
    }

    pub const fn destination(&self) -> Address {
        self.destination
    }

    pub const fn source(&self) -> Address {
        self.source
    }

    pub const fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The CRC received with the frame, `None` for locally built messages.
    pub const fn crc(&self) -> Option<u16> {
        self.crc
    }

    /// Acknowledgment id: the last two payload bytes, big-endian, or 0.
    pub fn ack_id(&self) -> u16 {
        match self.payload.len() {
            0 | 1 => 0,
            n => u16::from_be_bytes([self.payload[n - 2], self.payload[n - 1]]),
        }
    }

    /// Length of the serialized frame.
    pub fn frame_len(&self) -> usize {
        let explicit_len = if self.length_class().is_user_defined() {
            2
        } else {
            0
        };
        MIN_FRAME_LEN + explicit_len + 2 * self.address_width().bytes() + self.payload.len()
    }

    /// Serialize the frame.
    /// # Errors
    /// [`FrameError::PayloadTooLong`] if the payload is over [`MAX_PAYLOAD_LEN`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.payload.len();
        let explicit_len = u16::try_from(len).ok().context(PayloadTooLongSnafu { len })?;
        let width = self.address_width();
        let mut buf = Vec::with_capacity(self.frame_len());
        buf.push(START_BYTE);
        buf.push(self.flags);
        if self.length_class().is_user_defined() {
            buf.extend_from_slice(&explicit_len.to_be_bytes());
        }
        buf.extend_from_slice(&self.destination.to_bytes(width));
        buf.extend_from_slice(&self.source.to_bytes(width));
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        let crc = self.crc.unwrap_or_else(|| crc16(&buf));
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
            && self.destination == other.destination
            && self.source == other.source
            && self.command == other.command
            && self.payload == other.payload
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:#04x} @{} => {}",
            self.kind(),
            self.command,
            self.source,
            self.destination
        )
    }
}

/// Frame encoder/decoder for one configured address width.
///
/// A strict codec (the default) rejects frames with a bad CRC and frames
/// whose address width is neither "none" nor the configured width.
///
/// The maximum frame length only bounds how long a stream buffer waits for
/// a partial frame; [`decode`](Self::decode) accepts any length.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameCodec {
    width: AddressWidth,
    strict: bool,
    max_frame_len: usize,
}

impl FrameCodec {
    pub const fn new(width: AddressWidth) -> Self {
        Self {
            width,
            strict: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub const fn with_max_frame_len(self, max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            ..self
        }
    }

    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Accept any CRC and any address width.
    pub const fn lenient(self) -> Self {
        Self {
            strict: false,
            ..self
        }
    }

    pub const fn width(&self) -> AddressWidth {
        self.width
    }

    pub const fn is_strict(&self) -> bool {
        self.strict
    }

    /// Build a message using this codec's address width.
    pub fn message(
        &self,
        kind: MessageType,
        destination: Address,
        source: Address,
        command: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Message {
        Message::new(kind, destination, source, command, payload, self.width)
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FrameError> {
        message.to_bytes()
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// Returns the message and the number of bytes it occupied.
    /// # Errors
    /// [`FrameError::Truncated`] if more data is needed, [`FrameError::BadStart`]
    /// if `buf` doesn't start with a frame, and in strict mode
    /// [`FrameError::BadCrc`] or [`FrameError::WidthMismatch`].
    pub fn decode(&self, buf: &[u8]) -> Result<(Message, usize), FrameError> {
        let (rest, raw) = match nom_parser::frame(buf) {
            Ok(parsed) => parsed,
            Err(nom::Err::Incomplete(needed)) => {
                let needed = match needed {
                    Needed::Size(n) => n.get(),
                    Needed::Unknown => 1,
                };
                return TruncatedSnafu { needed }.fail();
            }
            Err(_) => {
                let found = buf.first().copied().unwrap_or_default();
                return BadStartSnafu { found }.fail();
            }
        };
        let len = buf.len() - rest.len();
        if self.strict {
            ensure!(
                raw.crc == raw.computed_crc,
                BadCrcSnafu {
                    received: raw.crc,
                    computed: raw.computed_crc,
                    len
                }
            );
            let found = AddressWidth::from_flags(raw.flags);
            ensure!(
                found == AddressWidth::None || found == self.width,
                WidthMismatchSnafu {
                    expected: self.width,
                    found,
                    len
                }
            );
        }
        Ok((Message::from_raw(&raw), len))
    }

    /// Decode back-to-back frames until `buf` is used up, stopping at the
    /// first error. Frames decoded before the error are returned with it.
    pub fn decode_all(&self, buf: &[u8]) -> (Vec<Message>, Result<(), FrameError>) {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            match self.decode(&buf[offset..]) {
                Ok((message, len)) => {
                    messages.push(message);
                    offset += len;
                }
                Err(err) => return (messages, Err(err)),
            }
        }
        (messages, Ok(()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(AddressWidth::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTHS: [AddressWidth; 4] = [
        AddressWidth::None,
        AddressWidth::One,
        AddressWidth::Two,
        AddressWidth::Four,
    ];

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7) as u8).collect()
    }

    #[test]
    fn test_length_class() {
        for len in 0..=8 {
            assert_eq!(LengthClass::for_length(len).flag_bits(), (len as u8) << 4);
            assert_eq!(LengthClass::for_length(len).fixed_length(), Some(len));
        }
        for (len, code) in [
            (16, 0x90),
            (32, 0xA0),
            (64, 0xB0),
            (128, 0xC0),
            (256, 0xD0),
            (512, 0xE0),
        ] {
            let class = LengthClass::for_length(len);
            assert_eq!(class.flag_bits(), code);
            assert_eq!(class.fixed_length(), Some(len));
        }
        for len in [9, 15, 17, 31, 100, 513, 65535] {
            let class = LengthClass::for_length(len);
            assert!(class.is_user_defined());
            assert_eq!(class.fixed_length(), None);
        }
    }

    #[test]
    fn test_round_trip() {
        let lengths = [0, 1, 8, 9, 16, 17, 32, 64, 128, 256, 512, 513];
        let kinds = [
            MessageType::Normal,
            MessageType::Immediate,
            MessageType::AckResponse,
            MessageType::NackResponse,
        ];
        for width in WIDTHS {
            let codec = FrameCodec::new(width);
            for len in lengths {
                for kind in kinds {
                    let msg = codec.message(kind, Address::new(0x12), Address::new(0x21), 0x40, payload(len));
                    let bytes = codec.encode(&msg).unwrap();
                    assert_eq!(bytes.len(), msg.frame_len());
                    let (decoded, used) = codec.decode(&bytes).unwrap();
                    assert_eq!(used, bytes.len());
                    assert_eq!(decoded, msg);
                    assert_eq!(decoded.payload().len(), len);
                    assert_eq!(decoded.kind(), kind);
                    // re-encoding a parsed frame reproduces the wire bytes
                    assert_eq!(decoded.to_bytes().unwrap(), bytes);
                }
            }
        }
    }

    #[test]
    fn test_explicit_length_bytes() {
        let codec = FrameCodec::new(AddressWidth::One);
        let msg = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 1, payload(513));
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[1] & 0xF0, 0xF0);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
    }

    #[test]
    fn test_payload_length_limit() {
        let codec = FrameCodec::default();
        let msg = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 1, payload(MAX_PAYLOAD_LEN));
        let bytes = codec.encode(&msg).unwrap();
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        let (decoded, used) = codec.decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.payload().len(), MAX_PAYLOAD_LEN);

        let msg = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 1, payload(MAX_PAYLOAD_LEN + 1));
        assert_eq!(
            codec.encode(&msg),
            Err(FrameError::PayloadTooLong { len: MAX_PAYLOAD_LEN + 1 })
        );
    }

    #[test]
    fn test_wire_layout() {
        let codec = FrameCodec::new(AddressWidth::Two);
        let msg = codec.message(
            MessageType::Immediate,
            Address::new(0x0102),
            Address::new(0x0304),
            0xE0,
            vec![9],
        );
        let bytes = msg.to_bytes().unwrap();
        let crc = crc16(&bytes[..8]);
        assert_eq!(
            bytes,
            vec![
                0xAA,
                0x19,
                0x01,
                0x02,
                0x03,
                0x04,
                0xE0,
                9,
                (crc >> 8) as u8,
                crc as u8
            ]
        );
    }

    #[test]
    fn test_empty_address_forces_no_width() {
        for width in WIDTHS {
            let codec = FrameCodec::new(width);
            for (dst, src) in [(0u32, 5u32), (5, 0), (0, 0)] {
                let msg = codec.message(MessageType::Normal, Address::new(dst), Address::new(src), 1, vec![]);
                assert_eq!(msg.to_bytes().unwrap()[1] & 0x0C, 0);
                assert_eq!(msg.destination(), Address::EMPTY);
                assert_eq!(msg.source(), Address::EMPTY);
                assert!(!msg.is_addressed());
            }
        }
    }

    #[test]
    fn test_crc_determinism() {
        let codec = FrameCodec::default();
        let a = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, b"LS01 ".to_vec());
        let b = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, b"LS01 ".to_vec());
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());

        let reference = a.to_bytes().unwrap();
        for bit in 0..8 {
            let mut flipped = b"LS01 ".to_vec();
            flipped[2] ^= 1 << bit;
            let c = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, flipped);
            let bytes = c.to_bytes().unwrap();
            assert_ne!(bytes[bytes.len() - 2..], reference[reference.len() - 2..]);
        }
    }

    #[test]
    fn test_bad_crc() {
        let codec = FrameCodec::default();
        let msg = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, vec![1, 2, 3]);
        let mut bytes = msg.to_bytes().unwrap();
        bytes[7] ^= 0x01;
        let len = bytes.len();
        assert!(matches!(
            codec.decode(&bytes),
            Err(FrameError::BadCrc { len: l, .. }) if l == len
        ));
        let (decoded, _) = codec.lenient().decode(&bytes).unwrap();
        assert_eq!(decoded.payload(), &[1, 2, 2]);
    }

    #[test]
    fn test_bad_start_and_truncated() {
        let codec = FrameCodec::default();
        assert_eq!(
            codec.decode(&[0x55, 0, 0, 0, 0]),
            Err(FrameError::BadStart { found: 0x55 })
        );
        assert_eq!(
            codec.decode(&[]),
            Err(FrameError::Truncated { needed: 1 })
        );
        let msg = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, vec![1, 2, 3]);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(
            codec.decode(&bytes[..bytes.len() - 2]),
            Err(FrameError::Truncated { needed: 2 })
        );
    }

    #[test]
    fn test_width_mismatch() {
        let two = FrameCodec::new(AddressWidth::Two);
        let one = FrameCodec::new(AddressWidth::One);
        let bytes = two
            .message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, vec![])
            .to_bytes().unwrap();
        assert_eq!(
            one.decode(&bytes),
            Err(FrameError::WidthMismatch {
                expected: AddressWidth::One,
                found: AddressWidth::Two,
                len: bytes.len()
            })
        );
        assert!(one.lenient().decode(&bytes).is_ok());

        // unaddressed frames are accepted by every width
        let bytes = two
            .message(MessageType::Normal, Address::EMPTY, Address::new(5), 0x40, vec![])
            .to_bytes().unwrap();
        assert!(one.decode(&bytes).is_ok());
    }

    #[test]
    fn test_decode_all() {
        let codec = FrameCodec::default();
        let a = codec.message(MessageType::Normal, Address::new(2), Address::new(5), 0x40, vec![1]);
        let b = codec.message(MessageType::Immediate, Address::new(3), Address::new(5), 0x41, vec![]);
        let mut bytes = a.to_bytes().unwrap();
        bytes.extend(b.to_bytes().unwrap());
        let (messages, result) = codec.decode_all(&bytes);
        assert_eq!(messages, vec![a.clone(), b]);
        assert!(result.is_ok());

        let mut bytes = a.to_bytes().unwrap();
        bytes.extend_from_slice(&[0x00, 0x01]);
        let (messages, result) = codec.decode_all(&bytes);
        assert_eq!(messages, vec![a]);
        assert_eq!(result, Err(FrameError::BadStart { found: 0 }));
    }

    #[test]
    fn test_ack_id() {
        let codec = FrameCodec::default();
        let ack = |payload: Vec<u8>| {
            codec.message(MessageType::AckResponse, Address::new(5), Address::new(2), 0x40, payload)
        };
        assert_eq!(ack(vec![]).ack_id(), 0);
        assert_eq!(ack(vec![7]).ack_id(), 0);
        assert_eq!(ack(vec![7, 0x12, 0x34]).ack_id(), 0x1234);
    }
}
