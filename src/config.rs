use std::time::Duration;

use crate::address::{Address, AddressWidth};
use crate::message::{FrameCodec, DEFAULT_MAX_FRAME_LEN};

/// How long a sent command waits for its acknowledgment.
#[cfg(debug_assertions)]
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a sent command waits for its acknowledgment.
#[cfg(not(debug_assertions))]
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for one [`BusController`](crate::BusController).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Local node address.
    pub address: Address,
    /// Address width used on every port.
    pub width: AddressWidth,
    /// Drop inbound frames whose source is the local address.
    pub ignore_own_messages: bool,
    pub ack_timeout: Duration,
    /// Pause after each transmitted frame.
    pub command_delay: Duration,
    /// Reject frames with a bad CRC or a foreign address width.
    pub strict: bool,
    /// Longest frame a stream port waits for before resynchronizing.
    pub max_frame_len: usize,
}

impl BusConfig {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_width(mut self, width: AddressWidth) -> Self {
        self.width = width;
        self
    }

    pub fn codec(&self) -> FrameCodec {
        let codec = FrameCodec::new(self.width).with_max_frame_len(self.max_frame_len);
        if self.strict {
            codec
        } else {
            codec.lenient()
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: Address::EMPTY,
            width: AddressWidth::default(),
            ignore_own_messages: true,
            ack_timeout: ACK_TIMEOUT,
            command_delay: Duration::ZERO,
            strict: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
