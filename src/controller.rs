//! The bus controller: one local address, a set of ports, and the decision
//! of what to do with every frame that arrives.
//!
//! The controller is synchronous. Ports push received bytes into a channel
//! owned by the controller; whoever owns the controller drains it with
//! [`BusController::process_pending`], or hands the controller to a
//! [`Bus`](crate::Bus) thread that does so. Either way exactly one frame is
//! adjudicated at a time.
//!
//! # Example
//! ```
//! use hbus_proto::controller::command;
//! use hbus_proto::{Address, BusConfig, BusController, BusStatus, CommandOutcome, Message};
//!
//! let mut bus = BusController::new(BusConfig::new(Address::new(2)), Vec::new());
//! bus.set_handler(|msg: &Message, _port: usize| CommandOutcome::Processed(msg.payload().to_vec()));
//! assert!(bus.send_command(command::PING, None, &[]).is_err());
//!
//! bus.open().unwrap();
//! bus.send_command(command::PING, None, &[]).unwrap();
//! assert_eq!(bus.status(), BusStatus::WaitAck);
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use log::{debug, error, info, trace, warn};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::address::Address;
use crate::bus::Event;
use crate::clock::{Clock, SystemClock};
use crate::config::BusConfig;
use crate::message::{FrameCodec, FrameError, Message, MessageType};
use crate::port::{Inbound, Link, Port};

/// Wire error codes, sent as the NACK payload.
pub mod error_code {
    pub const UNKNOWN: u8 = 0xFF;
    pub const BUS_BUSY: u8 = 0xF0;
    pub const MESSAGE_CORRUPTED: u8 = 0xF1;
    pub const RX_OVERSIZE: u8 = 0xF2;
    pub const RX_TIMEOUT: u8 = 0xF3;
    pub const BAD_CRC: u8 = 0xF4;
    /// A frame sent by this node came back.
    pub const ROUND_CHECK: u8 = 0xF5;
    /// An acknowledgment didn't match the pending request.
    pub const ACK_LOST: u8 = 0xF6;
    /// The command isn't supported.
    pub const MESSAGE_UNKNOWN: u8 = 0xF7;
}

/// Well-known command opcodes.
pub mod command {
    pub const RESET: u8 = 0x01;
    pub const ACTIVATE: u8 = 0x40;
    pub const DEACTIVATE: u8 = 0x41;
    pub const PING: u8 = 0xE0;
}

/// Error type for the controller
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum BusError {
    /// The controller is in [`BusStatus::Reset`].
    #[snafu(display("Bus controller is not open"))]
    NotOpen,
    #[snafu(display("No port number {}", port))]
    UnknownPort { port: usize },
    #[snafu(display("Failed to open port {}", port))]
    OpenPort {
        port: usize,
        source: std::io::Error,
    },
    #[snafu(display("Failed to encode frame"))]
    Encode { source: FrameError },
    /// The bus thread has exited.
    #[snafu(display("Bus thread stopped"))]
    Stopped,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum BusStatus {
    /// Closed, sends are refused.
    Reset,
    Ready,
    /// Transmitting.
    Send,
    /// A command was sent and its acknowledgment is pending.
    WaitAck,
}

/// What the application did with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Handled; the bytes go back in the ACK payload.
    Processed(Vec<u8>),
    /// Not for this application. Broadcasts are forwarded, direct commands
    /// get a NACK with [`error_code::MESSAGE_UNKNOWN`].
    NotProcessed,
    /// Handling failed; the code goes back in the NACK.
    Failed(u8),
}

/// Application callbacks.
///
/// Only [`Handler::command_received`] is required. Closures taking
/// `(&Message, usize)` and returning a [`CommandOutcome`] are handlers too.
///
/// Handlers run on the thread that owns the controller. Under a
/// [`Bus`](crate::Bus) that is the bus thread, so a handler must not block on
/// a [`BusHandle`](crate::BusHandle) of its own bus.
pub trait Handler: Send {
    /// A command addressed to this node, or a broadcast.
    fn command_received(&mut self, message: &Message, port: usize) -> CommandOutcome;

    /// A validated ACK or NACK. Returns whether it was processed.
    fn ack_received(&mut self, _message: &Message, _port: usize) -> bool {
        true
    }

    /// Every parsed frame, before any decision is made.
    fn message_received(&mut self, _message: &Message) {}

    fn command_sent(&mut self, _message: &Message) {}

    fn ack_sent(&mut self, _message: &Message) {}

    /// Every frame written to the ports.
    fn message_transmitted(&mut self, _message: &Message) {}
}

impl<F> Handler for F
where
    F: FnMut(&Message, usize) -> CommandOutcome + Send,
{
    fn command_received(&mut self, message: &Message, port: usize) -> CommandOutcome {
        self(message, port)
    }
}

struct NoHandler;

impl Handler for NoHandler {
    fn command_received(&mut self, _message: &Message, _port: usize) -> CommandOutcome {
        CommandOutcome::NotProcessed
    }
}

#[derive(Debug, Copy, Clone)]
enum Target {
    All,
    Only(usize),
    Except(usize),
}

impl Target {
    fn includes(self, port: usize) -> bool {
        match self {
            Self::All => true,
            Self::Only(n) => n == port,
            Self::Except(n) => n != port,
        }
    }
}

struct PortSlot {
    port: Box<dyn Port>,
    link: Link,
}

pub struct BusController {
    config: BusConfig,
    codec: FrameCodec,
    ports: Vec<PortSlot>,
    handler: Box<dyn Handler>,
    clock: Box<dyn Clock>,
    status: BusStatus,
    last_error: u8,
    total_errors: u32,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl BusController {
    /// Create a closed controller. Port numbers are indices into `ports`.
    pub fn new(config: BusConfig, ports: Vec<Box<dyn Port>>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let ports = ports
            .into_iter()
            .enumerate()
            .map(|(number, port)| PortSlot {
                link: Link::new(number, port.capabilities()),
                port,
            })
            .collect();
        Self {
            codec: config.codec(),
            config,
            ports,
            handler: Box::new(NoHandler),
            clock: Box::new(SystemClock),
            status: BusStatus::Reset,
            last_error: 0,
            total_errors: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn set_handler(&mut self, handler: impl Handler + 'static) {
        self.handler = Box::new(handler);
    }

    pub fn set_clock(&mut self, clock: impl Clock + 'static) {
        self.clock = Box::new(clock);
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn status(&self) -> BusStatus {
        self.status
    }

    /// Error code of the last adjudicated frame, 0 if none.
    pub fn last_error(&self) -> u8 {
        self.last_error
    }

    /// Unexpected failures since the last [`clear_errors`](Self::clear_errors).
    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    pub fn clear_errors(&mut self) {
        self.last_error = 0;
        self.total_errors = 0;
        debug!("errors cleared");
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn link(&self, port: usize) -> Option<&Link> {
        self.ports.get(port).map(|slot| &slot.link)
    }

    /// Start every port and accept sends.
    pub fn open(&mut self) -> Result<(), BusError> {
        for (number, slot) in self.ports.iter_mut().enumerate() {
            let inbound = Inbound::new(number, self.events_tx.clone());
            slot.port
                .open(inbound)
                .context(OpenPortSnafu { port: number })?;
        }
        self.status = BusStatus::Ready;
        info!(
            "bus {} open with {} ports",
            self.config.address,
            self.ports.len()
        );
        Ok(())
    }

    /// Stop every port. Sends are refused until the next [`open`](Self::open).
    pub fn close(&mut self) {
        for slot in self.ports.iter_mut() {
            slot.port.close();
            slot.link.clear_ack();
        }
        self.status = BusStatus::Reset;
        info!("bus {} closed", self.config.address);
    }

    /// Send a command expecting an acknowledgment.
    ///
    /// Without a destination the frame goes out unaddressed.
    pub fn send_command(
        &mut self,
        command: u8,
        destination: Option<Address>,
        data: &[u8],
    ) -> Result<(), BusError> {
        let message = self.build(MessageType::Normal, destination, command, data.to_vec());
        self.send_message(&message, Target::All)
    }

    /// Send a command that is never acknowledged.
    pub fn send_immediate(
        &mut self,
        command: u8,
        destination: Option<Address>,
        data: &[u8],
    ) -> Result<(), BusError> {
        let message = self.build(MessageType::Immediate, destination, command, data.to_vec());
        self.send_message(&message, Target::All)
    }

    pub fn send_ack(
        &mut self,
        command: u8,
        destination: Address,
        data: &[u8],
    ) -> Result<(), BusError> {
        let message = self.build(
            MessageType::AckResponse,
            Some(destination),
            command,
            data.to_vec(),
        );
        self.send_message(&message, Target::All)
    }

    pub fn send_nack(
        &mut self,
        command: u8,
        destination: Address,
        error_code: u8,
    ) -> Result<(), BusError> {
        let message = self.build(
            MessageType::NackResponse,
            Some(destination),
            command,
            vec![error_code],
        );
        self.send_message(&message, Target::All)
    }

    /// Parse `data` received on `port` and act on every frame in it.
    ///
    /// Returns the number of frames handled. A malformed frame stops parsing
    /// of the rest of `data`; it is logged, not returned.
    pub fn receive(
        &mut self,
        port: usize,
        data: &[u8],
        route: Option<&str>,
    ) -> Result<usize, BusError> {
        let slot = self.ports.get_mut(port).context(UnknownPortSnafu { port })?;
        let mut messages = Vec::new();
        if let Err(err) = slot
            .link
            .on_receive(&self.codec, data, route, |m| messages.push(m))
        {
            warn!("port {}: malformed data dropped: {}", port, err);
        }
        let count = messages.len();
        for message in messages {
            self.dispatch(message, port);
        }
        Ok(count)
    }

    /// Handle every event queued by the ports without blocking.
    ///
    /// Returns the number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return handled,
            }
        }
    }

    pub(crate) fn sender(&self) -> Sender<Event> {
        self.events_tx.clone()
    }

    /// Swap in a fresh event channel, disconnecting every existing sender.
    pub(crate) fn detach_events(&mut self) {
        let (tx, rx) = mpsc::channel();
        self.events_tx = tx;
        self.events_rx = rx;
    }

    /// Block until the next event arrives.
    pub(crate) fn next_event(&self) -> Option<Event> {
        self.events_rx.recv().ok()
    }

    /// Returns false on shutdown.
    pub(crate) fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Received { port, data, route } => {
                if let Err(err) = self.receive(port, &data, route.as_deref()) {
                    warn!("{}", err);
                }
                true
            }
            Event::Call(call) => {
                call(self);
                true
            }
            Event::Shutdown => false,
        }
    }

    fn build(
        &self,
        kind: MessageType,
        destination: Option<Address>,
        command: u8,
        payload: Vec<u8>,
    ) -> Message {
        self.codec.message(
            kind,
            destination.unwrap_or(Address::EMPTY),
            self.config.address,
            command,
            payload,
        )
    }

    fn dispatch(&mut self, message: Message, port: usize) {
        self.last_error = 0;
        self.call_handler("message_received", |h| h.message_received(&message));

        let local = self.config.address;
        let no_address = !message.is_addressed();
        let broadcast =
            !no_address && message.destination() == self.codec.width().broadcast();
        let for_me = message.destination() == local || no_address;
        let from_me = !message.source().is_empty() && message.source() == local;
        let immediate = message.kind() == MessageType::Immediate;
        let is_ack = message.kind().is_ack();
        debug!("{} received on port {}", message, port);

        if from_me && self.config.ignore_own_messages {
            warn!("{} originated from this node, dropped", message);
            self.restore_status();
            return;
        }

        let mut processed = false;
        let mut reply = Vec::new();
        if for_me || broadcast {
            if is_ack {
                if for_me {
                    processed = self.accept_ack(&message, port);
                }
            } else {
                let outcome =
                    self.call_handler("command_received", |h| h.command_received(&message, port));
                match outcome {
                    Some(CommandOutcome::Processed(payload)) => {
                        processed = true;
                        reply = payload;
                    }
                    Some(CommandOutcome::NotProcessed) | None => {}
                    Some(CommandOutcome::Failed(0)) => self.last_error = error_code::UNKNOWN,
                    Some(CommandOutcome::Failed(code)) => self.last_error = code,
                }
            }
        }

        if for_me && !broadcast && !immediate && !is_ack {
            let answer = if processed && self.last_error == 0 {
                self.build(
                    MessageType::AckResponse,
                    Some(message.source()),
                    message.command(),
                    reply,
                )
            } else {
                let code = match self.last_error {
                    0 => error_code::MESSAGE_UNKNOWN,
                    code => code,
                };
                self.build(
                    MessageType::NackResponse,
                    Some(message.source()),
                    message.command(),
                    vec![code],
                )
            };
            // refused sends are logged by send_message
            let _ = self.send_message(&answer, Target::Only(port));
        } else if !from_me
            && ((!for_me && !broadcast) || (!processed && broadcast))
            && (!message.destination().is_empty() || no_address)
            && self.ports.len() > 1
        {
            trace!("forwarding {} from port {}", message, port);
            let _ = self.send_message(&message, Target::Except(port));
        }
        self.restore_status();
    }

    fn accept_ack(&mut self, message: &Message, port: usize) -> bool {
        let now = self.clock.now();
        let timeout = self.config.ack_timeout;
        let valid = self
            .ports
            .get(port)
            .map_or(true, |slot| slot.link.check_ack(message, now, timeout));
        if !valid {
            self.last_error = error_code::ACK_LOST;
            error!("check ack from node {} failed", message.source());
            return false;
        }
        // the request went out on every port, so did its wait
        for slot in self.ports.iter_mut() {
            if slot.link.number() == port {
                slot.link.clear_ack();
            } else if slot.link.clear_ack_for(message) {
                trace!("port {}: wait for {} cleared", slot.link.number(), message.source());
            }
        }
        self.call_handler("ack_received", |h| h.ack_received(message, port))
            .unwrap_or(false)
    }

    fn send_message(&mut self, message: &Message, target: Target) -> Result<(), BusError> {
        if self.status == BusStatus::Reset {
            warn!("send of {} not possible with status {:?}", message, self.status);
            return NotOpenSnafu.fail();
        }
        let frame = self.codec.encode(message).context(EncodeSnafu)?;
        self.status = BusStatus::Send;

        let destination = message.destination();
        let kind = message.kind();
        // forwarded commands are acknowledged to their own source, broadcasts
        // never are
        let wait_ack = kind == MessageType::Normal
            && !destination.is_empty()
            && destination != self.codec.width().broadcast()
            && message.source() == self.config.address;
        let now = self.clock.now();
        for slot in self.ports.iter_mut() {
            let number = slot.link.number();
            if !target.includes(number) {
                continue;
            }
            let route = slot.link.route_for(destination);
            match slot.port.transmit(&frame, route) {
                Ok(()) => {
                    debug!("{} sent on port {}", message, number);
                    if wait_ack {
                        slot.link.wait_ack(destination, message.ack_id(), now);
                    }
                }
                Err(err) => error!("port {}: transmit failed: {}", number, err),
            }
        }

        if kind.is_ack() {
            self.call_handler("ack_sent", |h| h.ack_sent(message));
        } else {
            self.call_handler("command_sent", |h| h.command_sent(message));
        }
        if !self.config.command_delay.is_zero() {
            thread::sleep(self.config.command_delay);
        }
        self.status = if kind == MessageType::Normal {
            BusStatus::WaitAck
        } else {
            BusStatus::Ready
        };
        self.call_handler("message_transmitted", |h| h.message_transmitted(message));
        Ok(())
    }

    /// Run a handler callback, turning a panic into an error count.
    fn call_handler<T>(
        &mut self,
        name: &str,
        call: impl FnOnce(&mut dyn Handler) -> T,
    ) -> Option<T> {
        let handler = &mut self.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| call(&mut **handler))) {
            Ok(value) => Some(value),
            Err(_) => {
                self.set_error(name);
                None
            }
        }
    }

    fn set_error(&mut self, source: &str) {
        self.last_error = error_code::UNKNOWN;
        self.total_errors += 1;
        error!("unknown error in {}", source);
    }

    fn restore_status(&mut self) {
        if self.status != BusStatus::Reset {
            self.status = BusStatus::Ready;
        }
    }
}

impl Drop for BusController {
    fn drop(&mut self) {
        if self.status != BusStatus::Reset {
            self.close();
        }
    }
}
