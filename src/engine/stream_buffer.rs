//! Disk-backed response buffer.
//!
//! Created when a client stops accepting bytes mid-response. The upstream keeps
//! appending backend data as fast as the backend produces it; the client
//! drains from its own offset whenever its socket is writable. The backing
//! file is anonymous and is closed once the reader has consumed the whole,
//! known-length response.

use std::fs::File;
use std::io::{self, Write};

use crate::net::Stream;

/// Bytes handed to the sink per transfer call.
const DRAIN_CHUNK: usize = 1024 * 1024;

/// Destination able to take a byte range of a file.
pub trait FileSink {
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize>;
}

impl FileSink for Stream {
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> io::Result<usize> {
        Stream::send_file(self, file, offset, len)
    }
}

/// Result of one [`StreamBuffer::drain_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Everything up to the marked end was sent; the file is gone.
    Done,
    /// The sink would block; wait for it to become writable.
    Blocked,
    /// The reader caught up with the writer and the end is not known yet.
    CaughtUp,
}

#[derive(Debug)]
pub struct StreamBuffer {
    file: Option<File>,
    written: u64,
    offset: u64,
    total: Option<u64>,
}

impl StreamBuffer {
    /// Wraps a fresh spill file, seeding it with bytes already read but not sent.
    pub fn new(mut file: File, seed: &[u8]) -> io::Result<Self> {
        file.write_all(seed)?;
        Ok(Self {
            file: Some(file),
            written: seed.len() as u64,
            offset: 0,
            total: None,
        })
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream buffer closed"))?;
        file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Freezes the total length; no more appends are expected.
    pub fn mark_end(&mut self) {
        self.total = Some(self.written);
    }

    pub fn drain_into<S: FileSink>(&mut self, sink: &mut S) -> io::Result<Drain> {
        loop {
            let Some(file) = self.file.as_ref() else {
                return Ok(Drain::Done);
            };
            let available = self.written - self.offset;
            if available == 0 {
                if self.total == Some(self.offset) {
                    self.file = None;
                    return Ok(Drain::Done);
                }
                return Ok(Drain::CaughtUp);
            }

            let len = available.min(DRAIN_CHUNK as u64) as usize;
            match sink.send_file(file, self.offset, len) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.offset += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Drain::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
