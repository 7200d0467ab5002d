//! Per-engine reactor state shared by every connection step.
//!
//! Connections live in `conns` keyed by token. While a connection runs a step
//! it is taken out of the map and put back afterwards, so a step holds
//! `&mut self` for its own connection and `&mut Core` for everything else
//! (including its counterpart, reached by token).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};

use crate::engine::client::ClientConn;
use crate::engine::pool::ScratchPool;
use crate::engine::settings::{EngineSettings, WaitReason};
use crate::engine::upstream::UpstreamConn;
use crate::error::{Acquire, ProxyError};
use crate::net::{ConnectionId, ConnectionIds, Stream};
use crate::observability::metrics;

/// How often connections past their deadline are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A socket plus its registration state with the poller.
#[derive(Debug)]
pub struct Io {
    pub id: ConnectionId,
    pub stream: Stream,
    registered: bool,
}

impl Io {
    pub fn new(id: ConnectionId, stream: Stream) -> Self {
        Self {
            id,
            stream,
            registered: false,
        }
    }

    pub fn token(&self) -> Token {
        self.id.token()
    }
}

/// Entry of the interest set.
#[derive(Debug, Clone, Copy)]
pub struct Wait {
    pub interest: Interest,
    pub deadline: Instant,
    pub reason: WaitReason,
}

pub enum Conn {
    Client(ClientConn),
    Upstream(UpstreamConn),
}

impl Conn {
    pub fn token(&self) -> Token {
        match self {
            Conn::Client(c) => c.io.token(),
            Conn::Upstream(u) => u.io.token(),
        }
    }

    fn resume(&mut self, core: &mut Core) {
        match self {
            Conn::Client(c) => c.resume(core),
            Conn::Upstream(u) => u.resume(core),
        }
    }

    pub fn fail(&mut self, core: &mut Core, err: ProxyError) {
        match self {
            Conn::Client(c) => c.fail(core, err),
            Conn::Upstream(u) => u.fail(core, err),
        }
    }

    pub fn is_idle(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_idle(),
            Conn::Upstream(_) => false,
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Conn::Client(c) => c.is_closed(),
            Conn::Upstream(u) => u.is_closed(),
        }
    }
}

pub struct Core {
    registry: Registry,
    pub(crate) conns: HashMap<Token, Conn>,
    pub(crate) interest: HashMap<Token, Wait>,
    rerun: VecDeque<Token>,
    pub settings: EngineSettings,
    pub pool: ScratchPool,
    ids: ConnectionIds,
    /// Cached at the top of each reactor iteration.
    pub now: Instant,
    /// Set once graceful shutdown started; no connection persists after it.
    pub quitting: bool,
    threshold: usize,
    next_sweep: Instant,
}

impl Core {
    pub fn new(registry: Registry, settings: EngineSettings, first_token: usize) -> Self {
        let now = Instant::now();
        Self {
            registry,
            conns: HashMap::new(),
            interest: HashMap::new(),
            rerun: VecDeque::new(),
            threshold: settings.expiry_threshold(),
            settings,
            pool: ScratchPool::new(),
            ids: ConnectionIds::starting_at(first_token),
            now,
            quitting: false,
            next_sweep: now + SWEEP_INTERVAL,
        }
    }

    pub fn next_id(&mut self) -> ConnectionId {
        self.ids.next_id()
    }

    /// Registers `io` for `interest` and arms its deadline.
    ///
    /// Always (re)registers so an edge that fired while the connection was
    /// parked is reported again.
    pub fn wait(&mut self, io: &mut Io, interest: Interest, reason: WaitReason) -> io::Result<()> {
        let token = io.token();
        if io.registered {
            self.registry.reregister(&mut io.stream, token, interest)?;
        } else {
            self.registry.register(&mut io.stream, token, interest)?;
            io.registered = true;
        }
        let deadline = self.now + self.settings.timeouts.for_reason(reason);
        self.interest.insert(
            token,
            Wait {
                interest,
                deadline,
                reason,
            },
        );
        Ok(())
    }

    /// Drops `io` from the interest set; it stays registered but is parked.
    pub fn release(&mut self, io: &Io) {
        self.interest.remove(&io.token());
    }

    /// Removes every trace of `io` from the reactor.
    pub fn close(&mut self, io: &mut Io) {
        self.release(io);
        let token = io.token();
        self.rerun.retain(|t| *t != token);
        if io.registered {
            if let Err(e) = self.registry.deregister(&mut io.stream) {
                tracing::trace!(connection_id = %io.id, error = %e, "Deregister failed");
            }
            io.registered = false;
        }
    }

    /// Queues a parked connection to run again without an I/O wait.
    /// Connections waiting in the interest set are left to their readiness.
    pub fn wake(&mut self, token: Token) {
        if self.interest.contains_key(&token) || self.rerun.contains(&token) {
            return;
        }
        self.rerun.push_back(token);
    }

    pub fn is_waiting(&self, token: Token) -> bool {
        self.interest.contains_key(&token)
    }

    pub fn has_rerun(&self) -> bool {
        !self.rerun.is_empty()
    }

    /// True once no connection is tracked at all.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty() && self.rerun.is_empty()
    }

    pub fn interest_len(&self) -> usize {
        self.interest.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Runs one step of the connection behind `token`.
    pub fn resume(&mut self, token: Token) {
        if let Some(wait) = self.interest.remove(&token) {
            tracing::trace!(
                token = token.0,
                interest = ?wait.interest,
                reason = wait.reason.as_str(),
                "Connection ready"
            );
        }
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        conn.resume(self);
        self.restore(conn);
    }

    /// Drains the rerun queue once. Entries queued meanwhile run next time.
    pub fn run_queued(&mut self) {
        let batch = std::mem::take(&mut self.rerun);
        for token in batch {
            self.resume(token);
        }
    }

    /// Puts a connection back after a step unless the step closed it.
    pub fn restore(&mut self, conn: Conn) {
        if !conn.is_closed() {
            self.conns.insert(conn.token(), conn);
        }
    }

    pub fn take_client(&mut self, token: Token) -> Option<ClientConn> {
        match self.conns.remove(&token)? {
            Conn::Client(client) => Some(client),
            other => {
                self.conns.insert(token, other);
                None
            }
        }
    }

    pub fn take_upstream(&mut self, token: Token) -> Option<UpstreamConn> {
        match self.conns.remove(&token)? {
            Conn::Upstream(upstream) => Some(upstream),
            other => {
                self.conns.insert(token, other);
                None
            }
        }
    }

    /// Takes a new client and runs its first step right away.
    pub fn start_client(&mut self, stream: Stream, peer: String) {
        let id = self.next_id();
        metrics::record_accept();
        tracing::trace!(connection_id = %id, peer = %peer, "Accepted connection");
        self.conns
            .insert(id.token(), Conn::Client(ClientConn::new(Io::new(id, stream), peer)));
        self.resume(id.token());
    }

    /// Tracks a freshly connected upstream; its first step runs from the
    /// rerun queue, after the dispatching client has been put back.
    pub fn start_upstream(&mut self, upstream: UpstreamConn) {
        let token = upstream.io.token();
        self.conns.insert(token, Conn::Upstream(upstream));
        self.wake(token);
    }

    /// Runs a descriptor-allocating operation, reclaiming stale connections
    /// and retrying while descriptors are exhausted.
    pub fn acquire<T>(&mut self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        loop {
            match Acquire::from(op()) {
                Acquire::Acquired(value) => return Ok(value),
                Acquire::Fatal(e) => return Err(e),
                Acquire::Exhausted(e) => self.expire_forced(e)?,
            }
        }
    }

    /// Periodic deadline sweep.
    pub fn sweep(&mut self) {
        if self.now < self.next_sweep {
            return;
        }
        self.next_sweep = self.now + SWEEP_INTERVAL;
        self.expire_overdue();
    }

    /// How long the next poll may block.
    pub fn poll_timeout(&self) -> Duration {
        if self.has_rerun() {
            return Duration::ZERO;
        }
        self.settings
            .timeouts
            .smallest()
            .min(self.next_sweep.saturating_duration_since(self.now))
    }
}
