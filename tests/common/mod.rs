#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use hbus_proto::{
    Address, Capabilities, CommandOutcome, FrameCodec, Handler, Inbound, Message, MessageType,
    Port,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a frame with one byte addresses.
pub fn frame(kind: MessageType, dst: u32, src: u32, command: u8, payload: &[u8]) -> Vec<u8> {
    FrameCodec::default()
        .message(
            kind,
            Address::new(dst),
            Address::new(src),
            command,
            payload.to_vec(),
        )
        .to_bytes().unwrap()
}

pub fn decode(frame: &[u8]) -> Message {
    let (message, len) = FrameCodec::default().decode(frame).unwrap();
    assert_eq!(len, frame.len());
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub frame: Vec<u8>,
    pub route: Option<String>,
}

/// Everything written to a [`RecordingPort`], plus a way to feed it input.
#[derive(Clone, Default)]
pub struct Wire {
    sent: Arc<Mutex<Vec<Sent>>>,
    inbound: Arc<Mutex<Option<Inbound>>>,
}

impl Wire {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.sent().into_iter().map(|s| s.frame).collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.frames().iter().map(|f| decode(f)).collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear()
    }

    pub fn is_open(&self) -> bool {
        self.inbound.lock().unwrap().is_some()
    }

    /// Push bytes through the port's inbound channel, as a reader would.
    pub fn inject(&self, data: &[u8], route: Option<&str>) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some(inbound) => inbound.deliver(data, route),
            None => false,
        }
    }
}

/// A port that records what it transmits.
pub struct RecordingPort {
    wire: Wire,
    capabilities: Capabilities,
    pub fail_writes: bool,
}

impl RecordingPort {
    pub fn new() -> (Box<dyn Port>, Wire) {
        Self::with_capabilities(Capabilities {
            full_duplex: true,
            ..Capabilities::default()
        })
    }

    pub fn with_routes() -> (Box<dyn Port>, Wire) {
        Self::with_capabilities(Capabilities {
            full_duplex: true,
            multicast: true,
            has_routes: true,
        })
    }

    pub fn failing() -> (Box<dyn Port>, Wire) {
        let wire = Wire::default();
        let port = RecordingPort {
            wire: wire.clone(),
            capabilities: Capabilities::default(),
            fail_writes: true,
        };
        (Box::new(port), wire)
    }

    fn with_capabilities(capabilities: Capabilities) -> (Box<dyn Port>, Wire) {
        let wire = Wire::default();
        let port = RecordingPort {
            wire: wire.clone(),
            capabilities,
            fail_writes: false,
        };
        (Box::new(port), wire)
    }
}

impl Port for RecordingPort {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open(&mut self, inbound: Inbound) -> io::Result<()> {
        *self.wire.inbound.lock().unwrap() = Some(inbound);
        Ok(())
    }

    fn close(&mut self) {
        *self.wire.inbound.lock().unwrap() = None;
    }

    fn transmit(&mut self, frame: &[u8], route: Option<&str>) -> io::Result<()> {
        if self.fail_writes {
            return Err(Error::new(ErrorKind::BrokenPipe, "write failed"));
        }
        self.wire.sent.lock().unwrap().push(Sent {
            frame: frame.to_vec(),
            route: route.map(str::to_owned),
        });
        Ok(())
    }
}

/// Calls seen by a [`Recorder`].
#[derive(Clone, Default)]
pub struct Calls {
    pub commands: Arc<Mutex<Vec<(Message, usize)>>>,
    pub acks: Arc<Mutex<Vec<(Message, usize)>>>,
    pub received: Arc<Mutex<Vec<Message>>>,
    pub transmitted: Arc<Mutex<Vec<Message>>>,
}

impl Calls {
    pub fn commands(&self) -> Vec<(Message, usize)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<(Message, usize)> {
        self.acks.lock().unwrap().clone()
    }

    pub fn received(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn transmitted(&self) -> usize {
        self.transmitted.lock().unwrap().len()
    }
}

/// Handler answering every command with a fixed outcome.
pub struct Recorder {
    pub calls: Calls,
    pub outcome: CommandOutcome,
    pub panic_on_command: bool,
}

impl Recorder {
    pub fn new(outcome: CommandOutcome) -> (Self, Calls) {
        let calls = Calls::default();
        let recorder = Recorder {
            calls: calls.clone(),
            outcome,
            panic_on_command: false,
        };
        (recorder, calls)
    }
}

impl Handler for Recorder {
    fn command_received(&mut self, message: &Message, port: usize) -> CommandOutcome {
        self.calls
            .commands
            .lock()
            .unwrap()
            .push((message.clone(), port));
        if self.panic_on_command {
            panic!("handler failure");
        }
        self.outcome.clone()
    }

    fn ack_received(&mut self, message: &Message, port: usize) -> bool {
        self.calls.acks.lock().unwrap().push((message.clone(), port));
        true
    }

    fn message_received(&mut self, message: &Message) {
        self.calls.received.lock().unwrap().push(message.clone());
    }

    fn message_transmitted(&mut self, message: &Message) {
        self.calls.transmitted.lock().unwrap().push(message.clone());
    }
}

struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

type PipeT = Arc<(Mutex<PipeState>, Condvar)>;

/// Write half of an in-memory byte stream.
pub struct PipeWriter(PipeT);

/// Read half of an in-memory byte stream. Reads time out like a serial port.
pub struct PipeReader {
    pipe: PipeT,
    pub timeout: Duration,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let pipe: PipeT = Arc::new((
        Mutex::new(PipeState {
            data: VecDeque::new(),
            closed: false,
        }),
        Condvar::new(),
    ));
    (
        PipeWriter(Arc::clone(&pipe)),
        PipeReader {
            pipe,
            timeout: Duration::from_millis(50),
        },
    )
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (state, condvar) = &*self.0;
        state.lock().unwrap().data.extend(buf);
        condvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let (state, condvar) = &*self.0;
        state.lock().unwrap().closed = true;
        condvar.notify_all();
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (state, condvar) = &*self.pipe;
        let mut state = state.lock().unwrap();
        if state.data.is_empty() && !state.closed {
            state = condvar.wait_timeout(state, self.timeout).unwrap().0;
        }
        if state.data.is_empty() {
            return if state.closed {
                Ok(0)
            } else {
                Err(Error::new(ErrorKind::TimedOut, "pipe read timed out"))
            };
        }
        let len = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..len)) {
            *dst = src;
        }
        Ok(len)
    }
}
