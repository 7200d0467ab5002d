//! Upstream (backend) connection state machine.
//!
//! # States
//! ```text
//! Connecting → WritingHeaders → WritingBody → AwaitingResponse → ParsingHead
//!     → Relaying (straight to the client socket)
//!     → Buffering (into a StreamBuffer the client drains)
//! ```
//!
//! # Design Decisions
//! - One request per backend connection, always `Connection: close`
//! - The backend is drained as fast as it produces; once the client falls
//!   behind, the rest of the response goes to disk and never back to direct
//! - The request body always goes out with an explicit `Content-Length`

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use http::header::{self, HeaderName};
use http::{Method, Version};
use mio::{Interest, Token};

use crate::engine::client::ClientConn;
use crate::engine::core::{Conn, Core, Io};
use crate::engine::pool::READ_SIZE;
use crate::engine::settings::WaitReason;
use crate::engine::stream_buffer::StreamBuffer;
use crate::error::ProxyError;
use crate::http::{RequestBody, RequestContext, ResponseHead};

/// Client headers never forwarded as-is.
const STRIPPED: [HeaderName; 6] = [
    header::EXPECT,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
];

pub enum UpstreamState {
    Connecting {
        head: Vec<u8>,
        body: Option<RequestBody>,
    },
    WritingHeaders {
        head: Vec<u8>,
        sent: usize,
        body: Option<RequestBody>,
    },
    WritingBody {
        body: RequestBody,
        chunk: Vec<u8>,
        sent: usize,
    },
    AwaitingResponse,
    ParsingHead {
        buf: Vec<u8>,
    },
    Relaying,
    Buffering(Rc<RefCell<StreamBuffer>>),
    Closed,
}

pub struct UpstreamConn {
    pub io: Io,
    client: Token,
    method: Method,
    state: UpstreamState,
    /// Interim heads the client socket did not take yet.
    pending: Vec<u8>,
}

impl UpstreamConn {
    pub fn new(
        io: Io,
        client: Token,
        request: RequestContext,
        body: Option<RequestBody>,
        peer: &str,
    ) -> Self {
        let head = request_head(&request, peer, body.as_ref().map(RequestBody::len));
        Self {
            io,
            client,
            method: request.method,
            state: UpstreamState::Connecting { head, body },
            pending: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, UpstreamState::Closed)
    }

    pub fn resume(&mut self, core: &mut Core) {
        if let Err(e) = self.step(core) {
            self.fail(core, e);
        }
    }

    fn step(&mut self, core: &mut Core) -> Result<(), ProxyError> {
        loop {
            match &mut self.state {
                UpstreamState::Connecting { .. } => {
                    if !self.io.stream.is_connected()? {
                        core.wait(&mut self.io, Interest::WRITABLE, WaitReason::ProxySend)?;
                        return Ok(());
                    }
                    if let UpstreamState::Connecting { head, body } =
                        std::mem::replace(&mut self.state, UpstreamState::AwaitingResponse)
                    {
                        self.state = UpstreamState::WritingHeaders { head, sent: 0, body };
                    }
                }
                UpstreamState::WritingHeaders { head, sent, .. } => {
                    while *sent < head.len() {
                        match self.io.stream.write(&head[*sent..]) {
                            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                            Ok(n) => *sent += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                core.wait(&mut self.io, Interest::WRITABLE, WaitReason::ProxySend)?;
                                return Ok(());
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.state = match std::mem::replace(&mut self.state, UpstreamState::AwaitingResponse) {
                        UpstreamState::WritingHeaders {
                            body: Some(body), ..
                        } if !body.is_empty() => UpstreamState::WritingBody {
                            body,
                            chunk: Vec::with_capacity(READ_SIZE),
                            sent: 0,
                        },
                        _ => UpstreamState::AwaitingResponse,
                    };
                }
                UpstreamState::WritingBody { body, chunk, sent } => {
                    if *sent == chunk.len() {
                        chunk.resize(READ_SIZE, 0);
                        let n = loop {
                            match body.read(chunk) {
                                Ok(n) => break n,
                                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                                Err(e) => return Err(e.into()),
                            }
                        };
                        chunk.truncate(n);
                        *sent = 0;
                        if n == 0 {
                            // Body fully written; dropping it removes any spill file.
                            self.state = UpstreamState::AwaitingResponse;
                            continue;
                        }
                    }
                    match self.io.stream.write(&chunk[*sent..]) {
                        Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                        Ok(n) => *sent += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            core.wait(&mut self.io, Interest::WRITABLE, WaitReason::ProxySend)?;
                            return Ok(());
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                UpstreamState::AwaitingResponse | UpstreamState::ParsingHead { .. } => {
                    if !self.read_head(core)? {
                        return Ok(());
                    }
                }
                UpstreamState::Relaying | UpstreamState::Buffering(_) => return self.pump(core),
                UpstreamState::Closed => return Ok(()),
            }
        }
    }

    /// Reads until the response head parses. Returns false when it had to
    /// wait for more bytes.
    fn read_head(&mut self, core: &mut Core) -> Result<bool, ProxyError> {
        let mut scratch = core.pool.checkout();
        let result = self.read_head_with(core, &mut scratch);
        core.pool.checkin(scratch);
        result
    }

    fn read_head_with(&mut self, core: &mut Core, scratch: &mut [u8]) -> Result<bool, ProxyError> {
        loop {
            let n = match self.io.stream.read(scratch) {
                Ok(0) => return Err(ProxyError::UpstreamClosed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    core.wait(&mut self.io, Interest::READABLE, WaitReason::ProxyRead)?;
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let mut buf = match &mut self.state {
                UpstreamState::ParsingHead { buf } => {
                    buf.extend_from_slice(&scratch[..n]);
                    std::mem::take(buf)
                }
                _ => scratch[..n].to_vec(),
            };
            // Interim heads go through as they come; the final head decides.
            loop {
                match ResponseHead::parse(&buf)? {
                    Some((head, used)) if head.is_interim() => {
                        self.relay_interim(core, &head);
                        if self.is_closed() {
                            return Ok(true);
                        }
                        buf.drain(..used);
                    }
                    Some((head, used)) => {
                        self.start_response(core, head, &buf[used..])?;
                        return Ok(true);
                    }
                    None => {
                        self.state = UpstreamState::ParsingHead { buf };
                        break;
                    }
                }
            }
        }
    }

    fn relay_interim(&mut self, core: &mut Core, head: &ResponseHead) {
        let Some(mut client) = core.take_client(self.client) else {
            self.close(core);
            return;
        };
        tracing::trace!(connection_id = %self.io.id, status = head.status, "Interim response");
        if let Err(e) = client.relay_interim(head, &mut self.pending) {
            client.detach_upstream();
            client.fail(core, e.into());
            self.close(core);
        }
        core.restore(Conn::Client(client));
    }

    /// Sends the rewritten head plus any body bytes that came with it.
    fn start_response(
        &mut self,
        core: &mut Core,
        head: ResponseHead,
        rest: &[u8],
    ) -> Result<(), ProxyError> {
        let Some(mut client) = core.take_client(self.client) else {
            self.close(core);
            return Ok(());
        };
        let mut out = std::mem::take(&mut self.pending);
        out.extend_from_slice(&client.begin_response(&head, &self.method, core.quitting));
        core.restore(Conn::Client(client));
        tracing::trace!(connection_id = %self.io.id, status = head.status, "Response head received");

        out.extend_from_slice(rest);
        self.state = UpstreamState::Relaying;
        self.deliver(core, &out)
    }

    /// Moves backend bytes towards the client until the backend would block
    /// or reaches end of stream.
    fn pump(&mut self, core: &mut Core) -> Result<(), ProxyError> {
        let mut scratch = core.pool.checkout();
        let result = self.pump_with(core, &mut scratch);
        core.pool.checkin(scratch);
        result
    }

    fn pump_with(&mut self, core: &mut Core, scratch: &mut [u8]) -> Result<(), ProxyError> {
        while !self.is_closed() {
            match self.io.stream.read(scratch) {
                Ok(0) => {
                    self.finish(core);
                    return Ok(());
                }
                Ok(n) => self.deliver(core, &scratch[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    core.wait(&mut self.io, Interest::READABLE, WaitReason::ProxyRead)?;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn deliver(&mut self, core: &mut Core, data: &[u8]) -> Result<(), ProxyError> {
        if data.is_empty() {
            return Ok(());
        }
        if let UpstreamState::Buffering(buffer) = &self.state {
            buffer.borrow_mut().append(data)?;
            core.wake(self.client);
            return Ok(());
        }

        let Some(mut client) = core.take_client(self.client) else {
            self.close(core);
            return Ok(());
        };
        // The client goes back before any error reaches our failure path,
        // which needs to find it.
        let result = self.relay(core, &mut client, data);
        core.restore(Conn::Client(client));
        result
    }

    /// Direct mode: write to the client, spill the rest once it blocks.
    fn relay(
        &mut self,
        core: &mut Core,
        client: &mut ClientConn,
        data: &[u8],
    ) -> Result<(), ProxyError> {
        let sent = match client.relay(data) {
            Ok(sent) => sent,
            Err(e) => {
                client.detach_upstream();
                client.fail(core, e.into());
                self.close(core);
                return Ok(());
            }
        };
        if sent == data.len() {
            return Ok(());
        }

        let file = core.acquire(tempfile::tempfile)?;
        let buffer = Rc::new(RefCell::new(StreamBuffer::new(file, &data[sent..])?));
        self.state = UpstreamState::Buffering(Rc::clone(&buffer));
        client.write_blocked(core, buffer)
    }

    /// Backend end of stream after the head: the response is complete.
    fn finish(&mut self, core: &mut Core) {
        let buffered = match &self.state {
            UpstreamState::Buffering(buffer) => {
                buffer.borrow_mut().mark_end();
                true
            }
            _ => false,
        };
        self.close(core);

        let Some(mut client) = core.take_client(self.client) else {
            return;
        };
        if buffered {
            // The client finishes on its own once it drained the buffer.
            client.detach_upstream();
            core.restore(Conn::Client(client));
            core.wake(self.client);
        } else {
            client.response_done(core);
            core.restore(Conn::Client(client));
        }
    }

    pub fn fail(&mut self, core: &mut Core, err: ProxyError) {
        if self.is_closed() {
            return;
        }
        tracing::debug!(connection_id = %self.io.id, error = %err, "Upstream connection failed");
        self.close(core);
        if let Some(mut client) = core.take_client(self.client) {
            client.upstream_failed(core);
            core.restore(Conn::Client(client));
        }
    }

    /// The client went away; nothing left to deliver to.
    pub fn client_failed(&mut self, core: &mut Core) {
        tracing::trace!(connection_id = %self.io.id, "Client gone, closing upstream");
        self.close(core);
    }

    fn close(&mut self, core: &mut Core) {
        if self.is_closed() {
            return;
        }
        self.state = UpstreamState::Closed;
        core.close(&mut self.io);
    }
}

/// Rewrites a client request head for the backend.
pub fn request_head(request: &RequestContext, peer: &str, body_len: Option<u64>) -> Vec<u8> {
    let version: &[u8] = match request.version {
        Version::HTTP_11 => b"HTTP/1.1",
        _ => b"HTTP/1.0",
    };
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version);
    out.extend_from_slice(b"\r\nConnection: close\r\n");

    let forwarded = match request.forwarded_for() {
        Some(chain) => format!("{chain},{peer}"),
        None => peer.to_string(),
    };
    let mut forwarded_sent = false;
    for (name, value) in request.headers.iter() {
        if STRIPPED.contains(name) {
            continue;
        }
        if name.as_str() == "x-forwarded-for" {
            if !forwarded_sent {
                push_field(&mut out, "X-Forwarded-For", forwarded.as_bytes());
                forwarded_sent = true;
            }
            continue;
        }
        push_field(&mut out, &title_case(name.as_str()), value.as_bytes());
    }
    if !forwarded_sent {
        push_field(&mut out, "X-Forwarded-For", forwarded.as_bytes());
    }

    if let Some(len) = body_len {
        push_field(&mut out, "Content-Length", len.to_string().as_bytes());
        if let Some(content_type) = request.headers.get(header::CONTENT_TYPE) {
            push_field(&mut out, "Content-Type", content_type.as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn push_field(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// `x-request-id` → `X-Request-Id`.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}
