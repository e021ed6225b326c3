use crate::message::{FrameCodec, FrameError, START_BYTE};

/// Outcome of [`RxBuffer::scan`].
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// A complete, valid frame was removed from the buffer.
    Frame(Vec<u8>),
    /// The buffer holds the start of a frame, or nothing at all.
    NeedData,
    /// Bytes were dropped while resynchronizing on a start byte.
    Discarded(usize),
}

/// Receive buffer for byte-stream links, where frames may arrive split
/// across reads or back to back in a single read.
#[derive(Debug, Default)]
pub struct RxBuffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(256),
            read_pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub fn consume(&mut self, len: usize) {
        self.read_pos += len.min(self.len());
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.read_pos == self.data.len() {
            self.clear();
        } else if self.read_pos > self.data.capacity() / 2 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Try to take one frame off the front of the buffer.
    ///
    /// Garbage before a start byte and frames the codec rejects are dropped.
    /// A partial frame is given up when it would grow past the codec's
    /// maximum frame length, or, with a strict codec, when a complete frame
    /// with a valid CRC starts inside it.
    pub fn scan(&mut self, codec: &FrameCodec) -> Scan {
        if self.is_empty() {
            return Scan::NeedData;
        }
        let len = match codec.decode(self.as_slice()) {
            Ok((_, len)) => {
                let frame = self.as_slice()[..len].to_vec();
                self.consume(len);
                return Scan::Frame(frame);
            }
            Err(FrameError::Truncated { needed }) => {
                if self.len().saturating_add(needed) > codec.max_frame_len() {
                    self.resync_len()
                } else if let Some(pos) = self.next_frame(codec) {
                    pos
                } else {
                    return Scan::NeedData;
                }
            }
            Err(err) => err.frame_len().unwrap_or_else(|| self.resync_len()),
        };
        self.consume(len);
        Scan::Discarded(len)
    }

    /// Offset of a later start byte that begins a complete, valid frame.
    fn next_frame(&self, codec: &FrameCodec) -> Option<usize> {
        if !codec.is_strict() {
            return None;
        }
        let data = self.as_slice();
        (1..data.len())
            .filter(|&pos| data[pos] == START_BYTE)
            .find(|&pos| codec.decode(&data[pos..]).is_ok())
    }

    /// Bytes up to the next start byte after the first one.
    fn resync_len(&self) -> usize {
        self.as_slice()
            .iter()
            .skip(1)
            .position(|b| *b == START_BYTE)
            .map_or(self.len(), |pos| pos + 1)
    }
}
