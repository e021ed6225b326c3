//! Run a [`BusController`] on its own thread.
//!
//! Ports and callers share the controller's event channel, so received
//! frames and outgoing requests are handled one at a time, in arrival order.

use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, error};
use snafu::OptionExt;

use crate::address::Address;
use crate::controller::{BusController, BusError, BusStatus, StoppedSnafu};

type Call = Box<dyn FnOnce(&mut BusController) + Send>;

pub(crate) enum Event {
    /// Bytes read by a port.
    Received {
        port: usize,
        data: Vec<u8>,
        route: Option<String>,
    },
    Call(Call),
    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received { port, data, route } => f
                .debug_struct("Received")
                .field("port", port)
                .field("len", &data.len())
                .field("route", route)
                .finish(),
            Self::Call(_) => f.write_str("Call"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A controller running on a dedicated thread.
pub struct Bus {
    handle: BusHandle,
    thread: JoinHandle<BusController>,
}

impl Bus {
    /// Move `controller` to a new thread. The controller should already be
    /// open, or be opened through [`BusHandle::call`].
    pub fn spawn(controller: BusController) -> Self {
        let handle = BusHandle {
            tx: controller.sender(),
        };
        let thread = thread::spawn(move || run(controller));
        Self { handle, thread }
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Stop the thread, close the controller and give it back.
    pub fn shutdown(self) -> Result<BusController, BusError> {
        // the thread may already be gone, join tells
        let _ = self.handle.tx.send(Event::Shutdown);
        self.thread.join().ok().context(StoppedSnafu)
    }
}

fn run(mut controller: BusController) -> BusController {
    debug!("bus thread for {} started", controller.address());
    while let Some(event) = controller.next_event() {
        if !controller.handle_event(event) {
            break;
        }
    }
    controller.close();
    // pending calls are dropped, their callers see Stopped
    controller.detach_events();
    debug!("bus thread for {} stopped", controller.address());
    controller
}

/// Cloneable handle for talking to a [`Bus`] from any thread.
#[derive(Debug, Clone)]
pub struct BusHandle {
    tx: Sender<Event>,
}

impl BusHandle {
    /// Run `f` on the bus thread and wait for its result.
    ///
    /// Never call this from the bus thread itself, e.g. from a [`Handler`]:
    /// the call waits on a queue only that thread drains, and deadlocks.
    /// A handler already runs with the controller; return the reply through
    /// [`CommandOutcome`] instead.
    ///
    /// [`Handler`]: crate::Handler
    /// [`CommandOutcome`]: crate::CommandOutcome
    pub fn call<T, F>(&self, f: F) -> Result<T, BusError>
    where
        T: Send + 'static,
        F: FnOnce(&mut BusController) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let call: Call = Box::new(move |controller| {
            if reply_tx.send(f(controller)).is_err() {
                error!("bus call result dropped");
            }
        });
        self.tx
            .send(Event::Call(call))
            .ok()
            .context(StoppedSnafu)?;
        reply_rx.recv().ok().context(StoppedSnafu)
    }

    pub fn send_command(
        &self,
        command: u8,
        destination: Option<Address>,
        data: &[u8],
    ) -> Result<(), BusError> {
        let data = data.to_vec();
        self.call(move |c| c.send_command(command, destination, &data))?
    }

    pub fn send_immediate(
        &self,
        command: u8,
        destination: Option<Address>,
        data: &[u8],
    ) -> Result<(), BusError> {
        let data = data.to_vec();
        self.call(move |c| c.send_immediate(command, destination, &data))?
    }

    pub fn send_ack(&self, command: u8, destination: Address, data: &[u8]) -> Result<(), BusError> {
        let data = data.to_vec();
        self.call(move |c| c.send_ack(command, destination, &data))?
    }

    pub fn send_nack(&self, command: u8, destination: Address, code: u8) -> Result<(), BusError> {
        self.call(move |c| c.send_nack(command, destination, code))?
    }

    pub fn status(&self) -> Result<BusStatus, BusError> {
        self.call(|c| c.status())
    }

    pub fn last_error(&self) -> Result<u8, BusError> {
        self.call(|c| c.last_error())
    }

    pub fn clear_errors(&self) -> Result<(), BusError> {
        self.call(|c| c.clear_errors())
    }
}
