//! The transport contract and the per-port state the controller keeps.
//!
//! A [`Port`] moves bytes; it knows nothing about frames beyond handing
//! whatever it receives to its [`Inbound`] handle. Parsing, route learning
//! and acknowledgment bookkeeping happen in a [`Link`], owned by the
//! controller next to each port.

use std::io;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::address::Address;
use crate::bus::Event;
use crate::message::{FrameCodec, FrameError, Message};

/// What a transport can do, declared as data.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Sending and receiving can happen at the same time.
    pub full_duplex: bool,
    /// One physical send reaches several peers.
    pub multicast: bool,
    /// The transport reports a hardware address with each read, so routes
    /// can be learned from traffic.
    pub has_routes: bool,
}

/// A physical or logical link carrying HBus frames.
pub trait Port: Send {
    fn capabilities(&self) -> Capabilities;

    /// Start I/O. Received bytes go to `inbound`.
    fn open(&mut self, inbound: Inbound) -> io::Result<()>;

    /// Stop I/O, interrupting any blocked reader.
    fn close(&mut self);

    /// Write one serialized frame.
    ///
    /// `route` is the hardware address learned for the destination, when the
    /// port has routes and one is known.
    fn transmit(&mut self, frame: &[u8], route: Option<&str>) -> io::Result<()>;
}

/// Handle a port uses to pass received bytes to its controller.
#[derive(Debug, Clone)]
pub struct Inbound {
    port: usize,
    tx: Sender<Event>,
}

impl Inbound {
    pub(crate) fn new(port: usize, tx: Sender<Event>) -> Self {
        Self { port, tx }
    }

    /// Number of the port this handle belongs to.
    pub fn port(&self) -> usize {
        self.port
    }

    /// Queue `data` for the controller. `route` is the sender's hardware
    /// address, if the transport has one.
    ///
    /// Returns false once the controller is gone.
    pub fn deliver(&self, data: &[u8], route: Option<&str>) -> bool {
        self.tx
            .send(Event::Received {
                port: self.port,
                data: data.to_vec(),
                route: route.map(str::to_owned),
            })
            .is_ok()
    }
}

/// A protocol address bound to a transport-specific hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub address: Address,
    pub hw_address: String,
}

/// Routes learned from traffic on one port.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<RouteInfo>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` to `hw_address`, replacing any older binding.
    ///
    /// Returns true if the table changed.
    pub fn update(&mut self, address: Address, hw_address: &str) -> bool {
        match self.routes.iter().position(|r| r.address == address) {
            Some(pos) if self.routes[pos].hw_address == hw_address => false,
            Some(pos) => {
                self.routes.remove(pos);
                self.push(address, hw_address);
                true
            }
            None => {
                self.push(address, hw_address);
                true
            }
        }
    }

    fn push(&mut self, address: Address, hw_address: &str) {
        self.routes.push(RouteInfo {
            address,
            hw_address: hw_address.to_owned(),
        });
    }

    pub fn lookup(&self, address: Address) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.address == address)
            .map(|r| r.hw_address.as_str())
    }

    pub fn remove(&mut self, address: Address) -> Option<RouteInfo> {
        let pos = self.routes.iter().position(|r| r.address == address)?;
        Some(self.routes.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteInfo> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct AckWait {
    from: Address,
    id: u16,
    started: Instant,
}

/// Controller-side state of one port.
#[derive(Debug)]
pub struct Link {
    number: usize,
    capabilities: Capabilities,
    routes: RouteTable,
    ack_wait: Option<AckWait>,
    last_message: Option<Message>,
}

impl Link {
    pub fn new(number: usize, capabilities: Capabilities) -> Self {
        Self {
            number,
            capabilities,
            routes: RouteTable::new(),
            ack_wait: None,
            last_message: None,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.last_message.as_ref()
    }

    /// Hardware address to use when sending to `address`.
    pub fn route_for(&self, address: Address) -> Option<&str> {
        if self.capabilities.has_routes {
            self.routes.lookup(address)
        } else {
            None
        }
    }

    /// Parse every frame in `data` and pass each one to `deliver`.
    ///
    /// The first malformed frame stops parsing; frames before it have
    /// already been delivered. Returns the number of frames delivered.
    pub fn on_receive(
        &mut self,
        codec: &FrameCodec,
        data: &[u8],
        hw_address: Option<&str>,
        mut deliver: impl FnMut(Message),
    ) -> Result<usize, FrameError> {
        let (messages, result) = codec.decode_all(data);
        let count = messages.len();
        for message in messages {
            trace!("port {}: received {}", self.number, message);
            if let Some(hw) = hw_address {
                let source = message.source();
                if !source.is_empty() && self.routes.update(source, hw) {
                    debug!("port {}: route {} via {}", self.number, source, hw);
                }
            }
            self.last_message = Some(message.clone());
            deliver(message);
        }
        result.map(|_| count)
    }

    /// Start waiting for an acknowledgment from `from` carrying `id`.
    pub fn wait_ack(&mut self, from: Address, id: u16, now: Instant) {
        self.ack_wait = Some(AckWait {
            from,
            id,
            started: now,
        });
    }

    pub fn clear_ack(&mut self) {
        self.ack_wait = None;
    }

    /// Drop the pending request if `message` answers it, whatever its age.
    pub fn clear_ack_for(&mut self, message: &Message) -> bool {
        match self.ack_wait {
            Some(wait) if message.source() == wait.from && message.ack_id() == wait.id => {
                self.ack_wait = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.ack_wait.is_some()
    }

    /// Address being waited on, [`Address::EMPTY`] when idle.
    pub fn awaited(&self) -> Address {
        self.ack_wait.map_or(Address::EMPTY, |w| w.from)
    }

    /// Does `message` answer the pending request?
    ///
    /// Always true when nothing is pending. Otherwise source and id must
    /// match and the answer must arrive within `timeout`.
    pub fn check_ack(&self, message: &Message, now: Instant, timeout: Duration) -> bool {
        match self.ack_wait {
            None => true,
            Some(wait) => {
                message.source() == wait.from
                    && message.ack_id() == wait.id
                    && now.saturating_duration_since(wait.started) <= timeout
            }
        }
    }
}
