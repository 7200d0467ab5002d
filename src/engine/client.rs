//! Client connection state machine.
//!
//! # States
//! ```text
//! AwaitingHeaders → AwaitingBody → AwaitingTrailers → Dispatched → Streaming
//!        ↑                                                │            │
//!        └────────────── response done (persistent) ──────┴────────────┘
//! ```
//!
//! While `Dispatched` the upstream writes straight to this socket. Once the
//! client stops keeping up, the upstream hands over a [`StreamBuffer`] and the
//! client drains it on its own writability (`Streaming`).

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use http::{Method, Version};
use mio::{Interest, Token};

use crate::engine::core::{Conn, Core, Io};
use crate::engine::settings::WaitReason;
use crate::engine::stream_buffer::{Drain, StreamBuffer};
use crate::engine::upstream::UpstreamConn;
use crate::error::ProxyError;
use crate::http::{RequestBody, RequestParser, ResponseHead};
use crate::net::Stream;
use crate::observability::metrics;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\n\r\n";

pub enum ClientState {
    AwaitingHeaders,
    AwaitingBody(RequestBody),
    AwaitingTrailers(RequestBody),
    /// Handed to an upstream; parked until it reports back.
    Dispatched,
    Streaming(Rc<RefCell<StreamBuffer>>),
    Closed,
}

pub struct ClientConn {
    pub io: Io,
    /// Address appended to `X-Forwarded-For`.
    peer: String,
    parser: RequestParser,
    state: ClientState,
    upstream: Option<Token>,
    /// Whether the current response keeps the connection open.
    persistent: bool,
    /// Set once any response byte was produced for the current request.
    response_started: bool,
    /// HTTP/1.1 clients are sent interim `1xx` heads; older ones are not.
    interim_allowed: bool,
    served: u64,
}

impl ClientConn {
    pub fn new(io: Io, peer: String) -> Self {
        Self {
            io,
            peer,
            parser: RequestParser::new(),
            state: ClientState::AwaitingHeaders,
            upstream: None,
            persistent: false,
            response_started: false,
            interim_allowed: false,
            served: 0,
        }
    }

    pub fn resume(&mut self, core: &mut Core) {
        let result = match self.state {
            ClientState::AwaitingHeaders
            | ClientState::AwaitingBody(_)
            | ClientState::AwaitingTrailers(_) => self.read_request(core),
            ClientState::Streaming(_) => self.drain(core),
            ClientState::Dispatched | ClientState::Closed => Ok(()),
        };
        if let Err(e) = result {
            self.fail(core, e);
        }
    }

    /// Waiting for a new request with nothing buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ClientState::AwaitingHeaders) && self.parser.buffered() == 0
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ClientState::Closed)
    }

    fn read_request(&mut self, core: &mut Core) -> Result<(), ProxyError> {
        // Pipelined bytes left over from the previous request come first.
        if self.advance(core, &[])? {
            return Ok(());
        }
        let mut scratch = core.pool.checkout();
        let result = self.read_loop(core, &mut scratch);
        core.pool.checkin(scratch);
        result
    }

    fn read_loop(&mut self, core: &mut Core, scratch: &mut [u8]) -> Result<(), ProxyError> {
        loop {
            match self.io.stream.read(scratch) {
                Ok(0) => {
                    if !self.is_idle() {
                        tracing::debug!(connection_id = %self.io.id, "Client closed mid-request");
                    }
                    self.close(core);
                    return Ok(());
                }
                Ok(n) => {
                    if self.advance(core, &scratch[..n])? {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.wait_for_request(core);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait_for_request(&mut self, core: &mut Core) -> Result<(), ProxyError> {
        let reason = match self.state {
            ClientState::AwaitingHeaders if self.is_idle() && self.served > 0 => {
                WaitReason::Keepalive
            }
            ClientState::AwaitingBody(_) => WaitReason::ClientBody,
            _ => WaitReason::ClientHeader,
        };
        core.wait(&mut self.io, Interest::READABLE, reason)?;
        Ok(())
    }

    /// Feeds `data` through the request phases. Returns true once the client
    /// stopped reading (dispatched or closed).
    fn advance(&mut self, core: &mut Core, mut data: &[u8]) -> Result<bool, ProxyError> {
        loop {
            match &mut self.state {
                ClientState::AwaitingHeaders => {
                    if !self.parser.add_parse(data)? {
                        return Ok(false);
                    }
                    data = &[];
                    if let Some(request) = self.parser.request() {
                        metrics::record_request(request.method.as_str());
                        tracing::trace!(
                            connection_id = %self.io.id,
                            method = %request.method,
                            target = %request.target,
                            "Request head parsed"
                        );
                    }
                    if !self.prepare_body(core)? {
                        return Ok(true);
                    }
                }
                ClientState::AwaitingBody(body) => {
                    let mut chunk = Vec::new();
                    self.parser.filter_body(data, &mut chunk)?;
                    data = &[];
                    let limit = core.settings.client_max_body_size;
                    if limit > 0 && body.len() + chunk.len() as u64 > limit {
                        return Err(ProxyError::BodyTooLarge { limit });
                    }
                    body.append(&chunk)?;
                    if !self.parser.body_eof() {
                        return Ok(false);
                    }
                    match std::mem::replace(&mut self.state, ClientState::Dispatched) {
                        ClientState::AwaitingBody(body) if self.parser.is_chunked() => {
                            self.state = ClientState::AwaitingTrailers(body);
                        }
                        ClientState::AwaitingBody(body) => {
                            self.dispatch(core, Some(body))?;
                            return Ok(true);
                        }
                        other => self.state = other,
                    }
                }
                ClientState::AwaitingTrailers(_) => {
                    if !self.parser.trailers_done(data)? {
                        return Ok(false);
                    }
                    let body = match std::mem::replace(&mut self.state, ClientState::Dispatched) {
                        ClientState::AwaitingTrailers(body) => Some(body),
                        _ => None,
                    };
                    self.dispatch(core, body)?;
                    return Ok(true);
                }
                _ => return Ok(true),
            }
        }
    }

    /// Sets up the body buffer after a complete head. Returns false when the
    /// request went out without a body.
    fn prepare_body(&mut self, core: &mut Core) -> Result<bool, ProxyError> {
        let declared = self.parser.content_length();
        if declared == Some(0) {
            self.dispatch(core, None)?;
            return Ok(false);
        }

        let limit = core.settings.client_max_body_size;
        if let Some(len) = declared {
            if limit > 0 && len > limit {
                return Err(ProxyError::BodyTooLarge { limit });
            }
        }

        if self.parser.expects_continue() {
            self.send_continue()?;
        }

        let threshold = core.settings.client_body_buffer_size;
        let body = if RequestBody::needs_disk(declared, threshold) {
            RequestBody::disk(core.acquire(tempfile::tempfile)?)
        } else {
            RequestBody::memory(declared.unwrap_or(0) as usize)
        };
        self.state = ClientState::AwaitingBody(body);
        Ok(true)
    }

    /// Writes `100 Continue` without waiting. A socket that takes none of it
    /// is fine (the client sends its body after its own timeout); one that
    /// takes only part of it is not.
    fn send_continue(&mut self) -> Result<(), ProxyError> {
        let mut sent = 0;
        while sent < CONTINUE.len() {
            match self.io.stream.write(&CONTINUE[sent..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if sent == 0 {
                        break;
                    }
                    return Err(ProxyError::ContinueAborted);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.parser.clear_expect();
        Ok(())
    }

    fn dispatch(&mut self, core: &mut Core, mut body: Option<RequestBody>) -> Result<(), ProxyError> {
        core.release(&self.io);
        self.state = ClientState::Dispatched;
        self.response_started = false;
        self.persistent = false;

        let request = self
            .parser
            .take_request()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no request to dispatch"))?;
        self.interim_allowed = request.version == Version::HTTP_11;
        if let Some(body) = body.as_mut() {
            body.rewind()?;
        }
        let endpoint = core
            .settings
            .backends
            .first()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no backend configured"))?;

        let stream = match core.acquire(|| Stream::connect(&endpoint)) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(
                    connection_id = %self.io.id,
                    backend = %endpoint,
                    error = %e,
                    "Backend connect failed"
                );
                metrics::record_gateway_error();
                self.reply(BAD_GATEWAY);
                self.close(core);
                return Ok(());
            }
        };

        let id = core.next_id();
        tracing::trace!(
            connection_id = %self.io.id,
            upstream_id = %id,
            backend = %endpoint,
            body_bytes = body.as_ref().map(RequestBody::len).unwrap_or(0),
            "Dispatching request"
        );
        let upstream = UpstreamConn::new(Io::new(id, stream), self.io.token(), request, body, &self.peer);
        self.upstream = Some(id.token());
        core.start_upstream(upstream);
        Ok(())
    }

    /// Drains the streaming buffer into the socket.
    fn drain(&mut self, core: &mut Core) -> Result<(), ProxyError> {
        let ClientState::Streaming(buffer) = &self.state else {
            return Ok(());
        };
        let buffer = Rc::clone(buffer);
        let drained = buffer.borrow_mut().drain_into(&mut self.io.stream)?;
        match drained {
            Drain::Done => self.response_done(core),
            Drain::Blocked => {
                core.wait(&mut self.io, Interest::WRITABLE, WaitReason::ClientSend)?;
            }
            // Parked; the upstream wakes us after its next append.
            Drain::CaughtUp => {}
        }
        Ok(())
    }

    /// Decides persistence for the response and returns the head to send
    /// (empty for HTTP/0.9 clients).
    pub fn begin_response(&mut self, head: &ResponseHead, method: &Method, quitting: bool) -> Vec<u8> {
        self.response_started = true;
        self.persistent = self.parser.keepalive() && head.is_self_delimiting(method) && !quitting;
        if self.parser.headers_expected() {
            head.client_head(self.persistent)
        } else {
            Vec::new()
        }
    }

    /// Writes as much of `data` as the socket takes right now.
    pub fn relay(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut sent = 0;
        while sent < data.len() {
            match self.io.stream.write(&data[sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Relays an interim `1xx` head. Whatever the socket does not take now is
    /// queued in `pending`, ahead of the final head.
    pub fn relay_interim(&mut self, head: &ResponseHead, pending: &mut Vec<u8>) -> io::Result<()> {
        if !self.interim_allowed {
            return Ok(());
        }
        let bytes = head.interim_head();
        let sent = if pending.is_empty() { self.relay(&bytes)? } else { 0 };
        if sent > 0 && sent < bytes.len() {
            // A torn interim head leaves no room for a 502.
            self.response_started = true;
        }
        pending.extend_from_slice(&bytes[sent..]);
        Ok(())
    }

    /// The socket filled up mid-response: drain `buffer` from now on.
    pub fn write_blocked(
        &mut self,
        core: &mut Core,
        buffer: Rc<RefCell<StreamBuffer>>,
    ) -> Result<(), ProxyError> {
        self.state = ClientState::Streaming(buffer);
        metrics::record_spooled();
        tracing::trace!(connection_id = %self.io.id, "Client blocked, spooling response");
        core.wait(&mut self.io, Interest::WRITABLE, WaitReason::ClientSend)?;
        Ok(())
    }

    /// The upstream finished and no longer needs to be told about failures.
    pub fn detach_upstream(&mut self) {
        self.upstream = None;
    }

    pub fn response_done(&mut self, core: &mut Core) {
        self.upstream = None;
        self.served += 1;
        if self.persistent && !core.quitting && self.parser.next() {
            self.state = ClientState::AwaitingHeaders;
            core.wake(self.io.token());
        } else {
            self.close(core);
        }
    }

    pub fn upstream_failed(&mut self, core: &mut Core) {
        self.upstream = None;
        if !self.response_started {
            metrics::record_gateway_error();
            self.reply(BAD_GATEWAY);
        }
        self.close(core);
    }

    pub fn fail(&mut self, core: &mut Core, err: ProxyError) {
        if self.is_closed() {
            return;
        }
        if let ProxyError::BodyTooLarge { .. } = err {
            self.reply(TOO_LARGE);
        }
        tracing::debug!(connection_id = %self.io.id, error = %err, "Client connection failed");
        self.close(core);
    }

    /// Best-effort single write of a canned response.
    fn reply(&mut self, response: &[u8]) {
        if let Err(e) = self.io.stream.write(response) {
            tracing::trace!(connection_id = %self.io.id, error = %e, "Canned response not sent");
        }
    }

    fn close(&mut self, core: &mut Core) {
        if self.is_closed() {
            return;
        }
        self.state = ClientState::Closed;
        core.close(&mut self.io);
        if let Some(token) = self.upstream.take() {
            if let Some(mut upstream) = core.take_upstream(token) {
                upstream.client_failed(core);
                core.restore(Conn::Upstream(upstream));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::settings::EngineSettings;
    use mio::Poll;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::time::Duration;

    fn setup(settings: EngineSettings) -> (Poll, Core, Token, UnixStream) {
        let poll = Poll::new().unwrap();
        let mut core = Core::new(poll.registry().try_clone().unwrap(), settings, 10);
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        theirs.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let id = core.next_id();
        let io = Io::new(id, Stream::Unix(mio::net::UnixStream::from_std(ours)));
        core.conns
            .insert(id.token(), Conn::Client(ClientConn::new(io, "127.0.0.1".into())));
        (poll, core, id.token(), theirs)
    }

    fn settings() -> EngineSettings {
        EngineSettings::new(vec!["unix:/nonexistent/backend.sock".parse().unwrap()])
    }

    /// Fills our side's send buffer so the next write would block.
    fn fill_send_buffer(core: &mut Core, token: Token) {
        let Some(Conn::Client(c)) = core.conns.get_mut(&token) else {
            panic!("expected a client");
        };
        let chunk = [0u8; 65536];
        for size in [chunk.len(), 1] {
            loop {
                match c.io.stream.write(&chunk[..size]) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => panic!("unexpected write error: {e}"),
                }
            }
        }
    }

    /// A client whose request went out to a listening Unix backend.
    fn dispatched(raw: &[u8]) -> (Poll, Core, Token, UnixStream, tempfile::TempDir, UnixListener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.sock");
        let backend = UnixListener::bind(&path).unwrap();
        let endpoint = format!("unix:{}", path.display()).parse().unwrap();
        let (poll, mut core, token, mut peer) = setup(EngineSettings::new(vec![endpoint]));

        peer.write_all(raw).unwrap();
        core.resume(token);
        assert!(matches!(client(&core, token).state, ClientState::Dispatched));
        (poll, core, token, peer, dir, backend)
    }

    fn complete_response(core: &mut Core, token: Token) {
        let mut c = core.take_client(token).unwrap();
        let (head, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .unwrap();
        let out = c.begin_response(&head, &Method::GET, false);
        assert_eq!(c.relay(&out).unwrap(), out.len());
        c.response_done(core);
        core.restore(Conn::Client(c));
    }

    fn client(core: &Core, token: Token) -> &ClientConn {
        match &core.conns[&token] {
            Conn::Client(c) => c,
            Conn::Upstream(_) => panic!("expected a client"),
        }
    }

    #[test]
    fn idle_only_without_buffered_bytes() {
        let (_poll, mut core, token, mut peer) = setup(settings());
        assert!(client(&core, token).is_idle());

        peer.write_all(b"GET / HT").unwrap();
        core.resume(token);

        assert!(!client(&core, token).is_idle());
        assert_eq!(core.interest[&token].reason, WaitReason::ClientHeader);
    }

    #[test]
    fn oversized_declared_body_gets_413() {
        let mut settings = settings();
        settings.client_max_body_size = 10;
        let (_poll, mut core, token, mut peer) = setup(settings);

        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\n").unwrap();
        core.resume(token);

        assert!(!core.conns.contains_key(&token));
        let mut response = Vec::new();
        peer.read_to_end(&mut response).unwrap();
        assert_eq!(response, TOO_LARGE);
    }

    #[test]
    fn expect_continue_is_answered_before_the_body() {
        let (_poll, mut core, token, mut peer) = setup(settings());

        peer.write_all(b"PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n")
            .unwrap();
        core.resume(token);

        let mut interim = vec![0u8; CONTINUE.len()];
        peer.read_exact(&mut interim).unwrap();
        assert_eq!(interim, CONTINUE);
        assert!(matches!(client(&core, token).state, ClientState::AwaitingBody(_)));
        assert_eq!(core.interest[&token].reason, WaitReason::ClientBody);
    }

    #[test]
    fn unreachable_backend_gets_502() {
        let (_poll, mut core, token, mut peer) = setup(settings());

        peer.write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        core.resume(token);

        assert!(!core.conns.contains_key(&token));
        let mut response = Vec::new();
        peer.read_to_end(&mut response).unwrap();
        assert_eq!(response, BAD_GATEWAY);
    }

    #[test]
    fn peer_close_while_idle_closes_quietly() {
        let (_poll, mut core, token, peer) = setup(settings());
        drop(peer);
        core.resume(token);
        assert!(core.is_empty());
    }

    #[test]
    fn blocked_continue_is_skipped_and_the_body_still_read() {
        let (_poll, mut core, token, mut peer) = setup(settings());
        fill_send_buffer(&mut core, token);

        peer.write_all(b"PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n")
            .unwrap();
        core.resume(token);

        let c = client(&core, token);
        assert!(matches!(c.state, ClientState::AwaitingBody(_)));
        assert!(!c.parser.expects_continue());
        let request = c.parser.request().unwrap();
        assert!(!request.headers.contains_key(http::header::EXPECT));

        // The body completes the request, which is dispatched (and, with no
        // backend listening, closed).
        peer.write_all(b"data").unwrap();
        core.resume(token);
        assert!(!core.conns.contains_key(&token));
    }

    #[test]
    fn idle_again_after_a_persistent_response() {
        let (_poll, mut core, token, _peer, _dir, _backend) =
            dispatched(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(!client(&core, token).is_idle());

        complete_response(&mut core, token);

        let c = client(&core, token);
        assert!(matches!(c.state, ClientState::AwaitingHeaders));
        assert!(c.is_idle());
        assert!(core.has_rerun());
    }

    #[test]
    fn pipelined_leftovers_are_not_idle() {
        let (_poll, mut core, token, _peer, _dir, _backend) = dispatched(
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n",
        );

        complete_response(&mut core, token);

        let c = client(&core, token);
        assert!(matches!(c.state, ClientState::AwaitingHeaders));
        assert!(c.parser.buffered() > 0);
        assert!(!c.is_idle());
    }
}
