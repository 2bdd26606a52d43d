//! Framer: cut complete messages out of a byte stream (serial lines).
//!
//! A frame starts at `{` and ends at the first `}` not preceded by `\`.
//! Messages never nest braces, so depth is not tracked.

/// Default scratch capacity; longer frames are dropped.
pub const DEFAULT_FRAME_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
}

#[derive(Debug)]
pub struct Framer {
    state: State,
    buf: Vec<u8>,
    capacity: usize,
    overflows: u64,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: State::Idle,
            buf: Vec::with_capacity(capacity),
            capacity,
            overflows: 0,
        }
    }

    /// Feed one byte. Returns the frame it completes, if any.
    pub fn push_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::Idle => {
                if byte == b'{' {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.state = State::Accumulating;
                }
                None
            }
            State::Accumulating if self.buf.len() >= self.capacity => {
                self.overflows += 1;
                log::debug!("frame overflow after {} bytes, dropped", self.buf.len());
                self.reset();
                None
            }
            State::Accumulating => {
                let escaped = self.buf.last() == Some(&b'\\');
                self.buf.push(byte);
                if byte == b'}' && !escaped {
                    self.state = State::Idle;
                    Some(std::mem::take(&mut self.buf))
                } else {
                    None
                }
            }
        }
    }

    /// Feed a chunk of bytes; returns every frame completed within it, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Drop any partial frame and go back to idle.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }

    /// Frames dropped for exceeding the capacity.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn is_accumulating(&self) -> bool {
        self.state == State::Accumulating
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
