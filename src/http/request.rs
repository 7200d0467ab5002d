//! Incremental HTTP/1.x request parser.
//!
//! # Responsibilities
//! - Accumulate client bytes until a request head parses
//! - Decide body framing (none, declared length, chunked)
//! - Filter body bytes out of the input, leaving pipelined data in place
//! - Parse trailers after a chunked body
//! - Track persistence (keepalive) across requests on one connection

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};

use crate::http::{ChunkedDecoder, ParseError, MAX_HEADERS, MAX_HEAD_BYTES};

/// A parsed client request head, handed to the upstream side at dispatch.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestContext {
    /// Values of `X-Forwarded-For` joined into one chain, if the client sent any.
    pub fn forwarded_for(&self) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }
}

/// How the request body is delimited.
#[derive(Debug, Clone)]
pub enum BodyFraming {
    Empty,
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
}

#[derive(Debug)]
pub struct RequestParser {
    buf: Vec<u8>,
    request: Option<RequestContext>,
    framing: BodyFraming,
    declared: Option<u64>,
    keepalive: bool,
    headers_expected: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            request: None,
            framing: BodyFraming::Empty,
            declared: Some(0),
            keepalive: false,
            headers_expected: true,
        }
    }

    /// Appends `data` and tries to complete the request head.
    ///
    /// Returns `Ok(true)` once the head is parsed; the body (if any) is still in
    /// the buffer afterwards.
    pub fn add_parse(&mut self, data: &[u8]) -> Result<bool, ParseError> {
        self.buf.extend_from_slice(data);
        if self.request.is_some() {
            return Ok(true);
        }
        if self.buf.is_empty() {
            return Ok(false);
        }
        if self.parse_simple_request()? {
            return Ok(true);
        }

        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut fields);
        let used = match req.parse(&self.buf)? {
            httparse::Status::Complete(used) => used,
            httparse::Status::Partial => {
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok(false);
            }
        };

        let method = req.method.unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ParseError::InvalidHeader(method.to_string()))?;
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let target = req.path.unwrap_or("/").to_string();

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for field in req.headers.iter() {
            let name = HeaderName::from_bytes(field.name.as_bytes())
                .map_err(|_| ParseError::InvalidHeader(field.name.to_string()))?;
            let value = HeaderValue::from_bytes(field.value)
                .map_err(|_| ParseError::InvalidHeader(field.name.to_string()))?;
            headers.append(name, value);
        }
        self.buf.drain(..used);

        self.framing = framing_for(&headers)?;
        self.declared = match &self.framing {
            BodyFraming::Empty => Some(0),
            BodyFraming::Length { remaining } => Some(*remaining),
            BodyFraming::Chunked(_) => None,
        };
        self.keepalive = persistent(version, &headers);
        self.headers_expected = true;
        self.request = Some(RequestContext {
            method,
            target,
            version,
            headers,
        });
        Ok(true)
    }

    /// HTTP/0.9 `GET /path` without a version: no headers, no body, no
    /// header block in the response.
    fn parse_simple_request(&mut self) -> Result<bool, ParseError> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(false);
        };
        let line = &self.buf[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let (Some(b"GET"), Some(target), None) = (parts.next(), parts.next(), parts.next()) else {
            return Ok(false);
        };
        let target = String::from_utf8_lossy(target).into_owned();
        self.buf.drain(..=end);
        self.framing = BodyFraming::Empty;
        self.declared = Some(0);
        self.keepalive = false;
        self.headers_expected = false;
        self.request = Some(RequestContext {
            method: Method::GET,
            target,
            version: Version::HTTP_09,
            headers: HeaderMap::new(),
        });
        Ok(true)
    }

    /// Declared body length: `Some(0)` when there is no body, `None` when the
    /// length is unknown (chunked).
    pub fn content_length(&self) -> Option<u64> {
        self.declared
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.framing, BodyFraming::Chunked(_))
    }

    /// Appends `data` and moves whatever body bytes are available into `out`.
    pub fn filter_body(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), ParseError> {
        self.buf.extend_from_slice(data);
        match &mut self.framing {
            BodyFraming::Empty => {}
            BodyFraming::Length { remaining } => {
                let take = (*remaining).min(self.buf.len() as u64) as usize;
                out.extend(self.buf.drain(..take));
                *remaining -= take as u64;
            }
            BodyFraming::Chunked(decoder) => decoder.decode(&mut self.buf, out)?,
        }
        Ok(())
    }

    pub fn body_eof(&self) -> bool {
        match &self.framing {
            BodyFraming::Empty => true,
            BodyFraming::Length { remaining } => *remaining == 0,
            BodyFraming::Chunked(decoder) => decoder.body_eof(),
        }
    }

    /// Appends `data` and tries to consume the trailer section of a chunked
    /// body. Trailer fields are merged into the request headers.
    pub fn trailers_done(&mut self, data: &[u8]) -> Result<bool, ParseError> {
        self.buf.extend_from_slice(data);
        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (used, trailers) = match httparse::parse_headers(&self.buf, &mut fields)? {
            httparse::Status::Complete(done) => done,
            httparse::Status::Partial => {
                if self.buf.len() > MAX_HEAD_BYTES {
                    return Err(ParseError::HeadTooLarge);
                }
                return Ok(false);
            }
        };

        let mut merged = Vec::with_capacity(trailers.len());
        for field in trailers.iter() {
            let name = HeaderName::from_bytes(field.name.as_bytes())
                .map_err(|_| ParseError::InvalidHeader(field.name.to_string()))?;
            let value = HeaderValue::from_bytes(field.value)
                .map_err(|_| ParseError::InvalidHeader(field.name.to_string()))?;
            merged.push((name, value));
        }
        self.buf.drain(..used);
        if let Some(request) = self.request.as_mut() {
            for (name, value) in merged {
                request.headers.append(name, value);
            }
        }
        Ok(true)
    }

    pub fn request(&self) -> Option<&RequestContext> {
        self.request.as_ref()
    }

    /// Hands the parsed head over; the parser keeps its persistence flags.
    pub fn take_request(&mut self) -> Option<RequestContext> {
        self.request.take()
    }

    /// True if the client asked for `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.request
            .as_ref()
            .and_then(|r| r.headers.get(header::EXPECT))
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
            .unwrap_or(false)
    }

    pub fn clear_expect(&mut self) {
        if let Some(request) = self.request.as_mut() {
            request.headers.remove(header::EXPECT);
        }
    }

    /// Whether the connection may carry another request after this one.
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    /// False for HTTP/0.9 clients, which expect a bare body.
    pub fn headers_expected(&self) -> bool {
        self.headers_expected
    }

    /// Resets for the next request on a persistent connection. Buffered bytes
    /// (a pipelined request) are kept. Returns false when the connection must
    /// close instead.
    pub fn next(&mut self) -> bool {
        if !self.keepalive {
            return false;
        }
        self.request = None;
        self.framing = BodyFraming::Empty;
        self.declared = Some(0);
        self.keepalive = false;
        self.headers_expected = true;
        true
    }

    /// Bytes received but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn framing_for(headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
    let chunked = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .flat_map(|v| tokens(v))
        .last()
        .map(|coding| coding.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(BodyFraming::Chunked(ChunkedDecoder::new()));
    }

    let mut declared: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH).iter() {
        let len = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match declared {
            Some(prev) if prev != len => return Err(ParseError::InvalidContentLength),
            _ => declared = Some(len),
        }
    }
    Ok(match declared {
        Some(0) | None => BodyFraming::Empty,
        Some(remaining) => BodyFraming::Length { remaining },
    })
}

fn persistent(version: Version, headers: &HeaderMap) -> bool {
    let has = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .flat_map(|v| tokens(v))
            .any(|t| t.eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_11 => !has("close"),
        Version::HTTP_10 => has("keep-alive"),
        _ => false,
    }
}

fn tokens(value: &HeaderValue) -> impl Iterator<Item = &str> {
    value
        .to_str()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
