//! Node addresses and the address width they are encoded with.

use arrayvec::ArrayVec;
use core::fmt;
use core::str::FromStr;
use snafu::{ensure, OptionExt, Snafu};

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid HBus address or width.
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// Not enough bytes left to decode an address.
    #[snafu(display("Address needs {} bytes, {} available", needed, available))]
    AddressTruncated {
        /// Bytes required by the address width.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },
}

/// Number of bytes used for each of the destination and source addresses.
///
/// The discriminants are the address-width bits of the flags byte.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum AddressWidth {
    /// Point-to-point link, no addresses on the wire.
    None = 0x00,
    /// One byte per address.
    One = 0x04,
    /// Two bytes per address.
    Two = 0x08,
    /// Four bytes per address.
    Four = 0x0C,
}

impl AddressWidth {
    pub(crate) const FLAG_MASK: u8 = 0x0C;

    /// Decode the width from a flags byte.
    pub const fn from_flags(flags: u8) -> Self {
        match flags & Self::FLAG_MASK {
            0x04 => Self::One,
            0x08 => Self::Two,
            0x0C => Self::Four,
            _ => Self::None,
        }
    }

    /// The bits this width occupies in the flags byte.
    pub const fn flag_bits(self) -> u8 {
        self as u8
    }

    /// Bytes per address.
    pub const fn bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// The broadcast address: all ones within the width, 0 without addresses.
    pub const fn broadcast(self) -> Address {
        match self {
            Self::None => Address(0),
            Self::One => Address(0xFF),
            Self::Two => Address(0xFFFF),
            Self::Four => Address(0xFFFF_FFFF),
        }
    }

    /// The reserved host address, 0 without addresses.
    pub const fn host(self) -> Address {
        match self {
            Self::None => Address(0),
            _ => Address::HOST,
        }
    }
}

impl Default for AddressWidth {
    fn default() -> Self {
        Self::One
    }
}

impl TryFrom<usize> for AddressWidth {
    type Error = Error;

    /// Map a byte count (0, 1, 2 or 4) to a width.
    fn try_from(bytes: usize) -> Result<Self, Self::Error> {
        match bytes {
            0 => Ok(Self::None),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            _ => InvalidAddressSnafu.fail(),
        }
    }
}

impl FromStr for AddressWidth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: usize = s.trim().parse().ok().context(InvalidAddressSnafu)?;
        bytes.try_into()
    }
}

/// Byte representation of an address, at most four bytes.
pub type AddressBytes = ArrayVec<u8, 4>;

/// A node address.
///
/// The value is 32 bits wide; how many of those bytes go on the wire is
/// decided by the [`AddressWidth`] of the codec, not by the address itself.
///
/// ## Example
/// ```
/// use hbus_proto::{Address, AddressWidth};
/// let addr: Address = "5".parse().unwrap();
/// assert_eq!(addr, Address::new(5));
/// assert_eq!(addr.to_bytes(AddressWidth::Two).as_slice(), &[0, 5]);
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash, Default)]
#[repr(transparent)]
pub struct Address(u32);

impl Address {
    /// No address: unaddressed or point-to-point frames.
    pub const EMPTY: Self = Self(0);
    /// Reserved host address.
    pub const HOST: Self = Self(0x81);

    /// Create an address from its numeric value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The numeric value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// True for [`Address::EMPTY`].
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Decode an address of `width` bytes starting at `offset`.
    /// # Errors
    /// Returns [`Error::AddressTruncated`] if the buffer is too short.
    pub fn from_bytes(buf: &[u8], offset: usize, width: AddressWidth) -> Result<Self, Error> {
        let needed = width.bytes();
        if needed == 0 {
            return Ok(Self::EMPTY);
        }
        let available = buf.len().saturating_sub(offset);
        ensure!(
            available >= needed,
            AddressTruncatedSnafu { needed, available }
        );
        let value = buf[offset..offset + needed]
            .iter()
            .fold(0u32, |acc, byte| acc << 8 | u32::from(*byte));
        Ok(Self(value))
    }

    /// Encode the address big-endian, truncated to `width` bytes.
    pub fn to_bytes(self, width: AddressWidth) -> AddressBytes {
        let bytes = self.0.to_be_bytes();
        bytes[4 - width.bytes()..].iter().copied().collect()
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value.into())
    }
}

impl From<Address> for u32 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl PartialEq<u32> for Address {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parse a decimal address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .ok()
            .map(Self)
            .context(InvalidAddressSnafu)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
