//! HBus protocol for home-automation nodes.
//!
//! HBus is a small binary frame protocol with optional addressing, an
//! ACK/NACK round trip for normal commands, and store-and-forward routing
//! between several links. This crate provides:
//!
//! * the wire codec, [`Message`] and [`FrameCodec`],
//! * the [`ByteStack`] used to build and read command payloads,
//! * the [`Port`] transport contract with a generic byte-stream port,
//!   [`StreamPort`],
//! * the [`BusController`] that decides whether each received frame is
//!   handled, acknowledged, forwarded or dropped, and [`Bus`], which runs a
//!   controller on its own thread.
//!
//! The library only logs through the `log` facade; install a logger in
//! the application to see the traffic.
//!
//! # Example
//! ```
//! use hbus_proto::{Address, AddressWidth, FrameCodec, MessageType};
//!
//! let codec = FrameCodec::new(AddressWidth::One);
//! let ping = codec.message(MessageType::Normal, Address::new(2), Address::HOST, 0xE0, vec![]);
//! let bytes = codec.encode(&ping).unwrap();
//! assert_eq!(&bytes[..5], &[0xAA, 0x04, 0x02, 0x81, 0xE0]);
//! assert_eq!(bytes.len(), 7);
//!
//! let (decoded, len) = codec.decode(&bytes).unwrap();
//! assert_eq!(len, bytes.len());
//! assert_eq!(decoded, ping);
//! ```

pub mod address;
pub mod binary;
mod buffer;
mod bus;
pub mod clock;
mod config;
pub mod controller;
pub mod message;
mod nom_parser;
pub mod port;
pub mod stack;
mod stream;

pub use address::{Address, AddressWidth};
pub use buffer::{RxBuffer, Scan};
pub use bus::{Bus, BusHandle};
pub use config::{BusConfig, ACK_TIMEOUT};
pub use controller::{BusController, BusError, BusStatus, CommandOutcome, Handler};
pub use message::{FrameCodec, FrameError, LengthClass, Message, MessageType};
pub use port::{Capabilities, Inbound, Link, Port, RouteInfo, RouteTable};
pub use stack::ByteStack;
pub use stream::StreamPort;
