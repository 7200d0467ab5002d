//! Chunked transfer-coding decoder.
//!
//! Decodes in place from the parser's input buffer: consumed bytes are drained,
//! anything past the last chunk (trailers, pipelined requests) stays put.

use crate::http::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    /// Last chunk seen; trailer fields (possibly none) follow.
    Trailers,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Moves decoded payload from `input` into `out`.
    ///
    /// Stops when more input is needed or the last chunk was reached.
    pub fn decode(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let mut pos = 0;
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(&input[pos..]) {
                    Ok(httparse::Status::Complete((used, 0))) => {
                        pos += used;
                        self.state = ChunkState::Trailers;
                    }
                    Ok(httparse::Status::Complete((used, size))) => {
                        pos += used;
                        self.state = ChunkState::Data { remaining: size };
                    }
                    Ok(httparse::Status::Partial) => break,
                    Err(_) => return Err(ParseError::InvalidChunk),
                },
                ChunkState::Data { remaining } => {
                    let available = (input.len() - pos) as u64;
                    if available == 0 {
                        break;
                    }
                    let take = remaining.min(available) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data { remaining }
                    };
                }
                ChunkState::DataCrlf => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => break,
            }
        }
        input.drain(..pos);
        Ok(())
    }

    /// True once the zero-size chunk has been consumed.
    pub fn body_eof(&self) -> bool {
        self.state == ChunkState::Trailers
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}
