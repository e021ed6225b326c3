//! A [`Port`] over any byte stream: serial lines, TCP sockets, pipes.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::buffer::{RxBuffer, Scan};
use crate::message::FrameCodec;
use crate::port::{Capabilities, Inbound, Port};

const READ_CHUNK: usize = 256;
const ERROR_BACKOFF: Duration = Duration::from_millis(10);
const CLOSE_WAIT: Duration = Duration::from_millis(500);

/// Byte-stream transport.
///
/// Reads happen on a background thread started by [`Port::open`]; frames are
/// cut out of the stream with an [`RxBuffer`] and delivered whole. Writes
/// happen on the caller's thread.
///
/// The reader should have a read timeout (serial ports and sockets both
/// support one) so [`Port::close`] can stop the thread. A reader that blocks
/// forever is left behind on close and can't be reopened.
pub struct StreamPort<R, W> {
    name: String,
    codec: FrameCodec,
    capabilities: Capabilities,
    reader: Option<R>,
    writer: W,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<R>>,
}

impl<R, W> StreamPort<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send,
{
    pub fn new(name: impl Into<String>, reader: R, writer: W, codec: FrameCodec) -> Self {
        Self {
            name: name.into(),
            codec,
            capabilities: Capabilities {
                full_duplex: true,
                ..Capabilities::default()
            },
            reader: Some(reader),
            writer,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Override the declared capabilities, e.g. for a shared RS-485 line.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<R, W> Port for StreamPort<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send,
{
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open(&mut self, inbound: Inbound) -> io::Result<()> {
        let reader = self.reader.take().ok_or_else(|| {
            io::Error::new(ErrorKind::NotConnected, "stream reader not available")
        })?;
        self.running.store(true, Ordering::Release);
        let reader_loop = ReadLoop {
            name: self.name.clone(),
            codec: self.codec,
            inbound,
            running: Arc::clone(&self.running),
        };
        let spawned = thread::Builder::new()
            .name(format!("hbus-{}", self.name))
            .spawn(move || reader_loop.run(reader));
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("{}: open", self.name);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let deadline = Instant::now() + CLOSE_WAIT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(ERROR_BACKOFF);
            }
            if handle.is_finished() {
                match handle.join() {
                    Ok(reader) => self.reader = Some(reader),
                    Err(_) => error!("{}: reader thread panicked", self.name),
                }
            } else {
                warn!("{}: reader thread still running, detached", self.name);
            }
        }
        info!("{}: closed", self.name);
    }

    fn transmit(&mut self, frame: &[u8], _route: Option<&str>) -> io::Result<()> {
        trace!("{}: tx {:02x?}", self.name, frame);
        self.writer.write_all(frame)?;
        self.writer.flush()
    }
}

struct ReadLoop {
    name: String,
    codec: FrameCodec,
    inbound: Inbound,
    running: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run<R: Read>(self, mut reader: R) -> R {
        let mut buffer = RxBuffer::new();
        let mut chunk = [0; READ_CHUNK];
        while self.running.load(Ordering::Acquire) {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    debug!("{}: end of stream", self.name);
                    break;
                }
                Ok(len) => {
                    buffer.write(&chunk[..len]);
                    if !self.drain(&mut buffer) {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ERROR_BACKOFF),
                Err(err) => {
                    error!("{}: read failed: {}", self.name, err);
                    buffer.clear();
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        self.running.store(false, Ordering::Release);
        reader
    }

    /// Deliver every complete frame. Returns false when the controller is gone.
    fn drain(&self, buffer: &mut RxBuffer) -> bool {
        loop {
            match buffer.scan(&self.codec) {
                Scan::Frame(frame) => {
                    if !self.inbound.deliver(&frame, None) {
                        debug!("{}: controller gone", self.name);
                        return false;
                    }
                }
                Scan::Discarded(len) => warn!("{}: discarded {} bytes", self.name, len),
                Scan::NeedData => return true,
            }
        }
    }
}
