//! Request body buffer.
//!
//! Small bodies of known length stay in memory; everything else spills to an
//! anonymous temporary file that disappears when the buffer is dropped.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

#[derive(Debug)]
pub enum RequestBody {
    Memory(Cursor<Vec<u8>>),
    Disk { file: File, len: u64 },
}

impl RequestBody {
    pub fn memory(capacity: usize) -> Self {
        RequestBody::Memory(Cursor::new(Vec::with_capacity(capacity)))
    }

    /// Wraps an already-created spill file.
    pub fn disk(file: File) -> Self {
        RequestBody::Disk { file, len: 0 }
    }

    /// Whether a body of `declared` length (None = unknown) belongs on disk.
    pub fn needs_disk(declared: Option<u64>, threshold: u64) -> bool {
        match declared {
            Some(len) => len >= threshold,
            None => true,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            RequestBody::Memory(cursor) => cursor.write_all(bytes),
            RequestBody::Disk { file, len } => {
                file.write_all(bytes)?;
                *len += bytes.len() as u64;
                Ok(())
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Memory(cursor) => cursor.get_ref().len() as u64,
            RequestBody::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        match self {
            RequestBody::Memory(cursor) => {
                cursor.set_position(0);
                Ok(())
            }
            RequestBody::Disk { file, .. } => file.seek(SeekFrom::Start(0)).map(|_| ()),
        }
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RequestBody::Memory(cursor) => cursor.read(buf),
            RequestBody::Disk { file, .. } => file.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_storage_by_declared_length() {
        assert!(!RequestBody::needs_disk(Some(10), 1024));
        assert!(RequestBody::needs_disk(Some(1024), 1024));
        assert!(RequestBody::needs_disk(None, 1024));
    }

    #[test]
    fn disk_body_round_trips() {
        let mut body = RequestBody::disk(tempfile::tempfile().unwrap());
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        for piece in payload.chunks(7_919) {
            body.append(piece).unwrap();
        }
        assert_eq!(body.len(), payload.len() as u64);
        assert!(matches!(body, RequestBody::Disk { .. }));

        body.rewind().unwrap();
        let mut back = Vec::new();
        body.read_to_end(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn memory_body_round_trips() {
        let mut body = RequestBody::memory(16);
        body.append(b"hello ").unwrap();
        body.append(b"world").unwrap();
        body.rewind().unwrap();

        let mut back = String::new();
        body.read_to_string(&mut back).unwrap();
        assert_eq!(back, "hello world");
    }
}
