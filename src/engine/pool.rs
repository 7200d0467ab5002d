//! Per-engine pool of scratch read buffers.
//!
//! A buffer is checked out for the duration of one read loop and handed back
//! before the step returns, so an engine needs only as many buffers as it has
//! nested reads in flight (in practice one or two).

/// Size of one socket read.
pub const READ_SIZE: usize = 0x4000;

/// Keep at most this many idle buffers around.
const MAX_IDLE: usize = 8;

#[derive(Debug, Default)]
pub struct ScratchPool {
    idle: Vec<Vec<u8>>,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a zero-filled buffer of [`READ_SIZE`] bytes.
    pub fn checkout(&mut self) -> Vec<u8> {
        match self.idle.pop() {
            Some(buf) => buf,
            None => vec![0u8; READ_SIZE],
        }
    }

    pub fn checkin(&mut self, mut buf: Vec<u8>) {
        if self.idle.len() >= MAX_IDLE {
            return;
        }
        buf.resize(READ_SIZE, 0);
        self.idle.push(buf);
    }
}
