//! Backend response head parsing and the client-facing rewrite.

use http::Method;

use crate::http::{ParseError, MAX_HEADERS, MAX_HEAD_BYTES};

/// Status line and header fields of a backend response, as received.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    /// Tries to parse a complete head from `buf`.
    ///
    /// Returns the head and the number of bytes it occupied; anything after
    /// that is the start of the body.
    pub fn parse(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut fields);
        match res.parse(buf)? {
            httparse::Status::Complete(used) => {
                let head = ResponseHead {
                    status: res.code.unwrap_or(502),
                    reason: res.reason.unwrap_or("").to_string(),
                    headers: res
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), h.value.to_vec()))
                        .collect(),
                };
                Ok(Some((head, used)))
            }
            httparse::Status::Partial if buf.len() > MAX_HEAD_BYTES => Err(ParseError::HeadTooLarge),
            httparse::Status::Partial => Ok(None),
        }
    }

    fn has(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// `1xx` heads that precede the final response. `101` is final: the
    /// connection is handed over after it.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Whether the client can find the end of this response without the
    /// connection closing.
    pub fn is_self_delimiting(&self, method: &Method) -> bool {
        if *method == Method::HEAD || matches!(self.status, 204 | 304) {
            return true;
        }
        let chunked = self.headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("transfer-encoding")
                && String::from_utf8_lossy(v).to_ascii_lowercase().contains("chunked")
        });
        chunked || self.has("content-length")
    }

    /// Builds the head sent to the client: `Connection` reflects whether the
    /// client connection persists, hop-by-hop fields from the backend are
    /// dropped, the rest is passed through verbatim.
    pub fn client_head(&self, persistent: bool) -> Vec<u8> {
        let connection: &[u8] = if persistent {
            b"Connection: keep-alive\r\n"
        } else {
            b"Connection: close\r\n"
        };
        self.encode(Some(connection))
    }

    /// An interim head as relayed to the client, without a `Connection` field.
    pub fn interim_head(&self) -> Vec<u8> {
        self.encode(None)
    }

    fn encode(&self, connection: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        if !self.reason.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if let Some(connection) = connection {
            out.extend_from_slice(connection);
        }
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("keep-alive") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}
