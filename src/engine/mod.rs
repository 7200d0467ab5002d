//! Connection engine subsystem.
//!
//! # Data Flow
//! ```text
//! public listener (accept loop)
//!     → client.rs (parse head, buffer body in memory or on disk)
//!     → upstream.rs (connect, write translated request, parse response head)
//!     → client socket directly, or stream_buffer.rs once the client blocks
//!     → client.rs (drain, then keepalive or close)
//! ```
//!
//! # Design Decisions
//! - One single-threaded, readiness-driven reactor per engine; engines share
//!   nothing but the listener sockets and the shutdown flag
//! - Edge-triggered: every step reads or writes until it would block
//! - A connection is either waiting in the interest set, queued for a rerun,
//!   or parked on its counterpart
//! - Descriptor exhaustion reclaims stale connections instead of failing

pub mod client;
pub mod core;
pub mod expiry;
pub mod pool;
pub mod settings;
pub mod stream_buffer;
pub mod upstream;

pub use self::core::Core;
pub use expiry::ExpiryReason;
pub use settings::{EngineSettings, Timeouts, WaitReason};
pub use stream_buffer::{Drain, StreamBuffer};

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::is_descriptor_exhaustion;
use crate::lifecycle::Shutdown;
use crate::net::Listener;
use crate::observability::metrics;

/// Wakes the poll when shutdown is triggered.
const WAKER: Token = Token(0);

/// Listener `i` is registered as `Token(FIRST_LISTENER + i)`.
const FIRST_LISTENER: usize = 1;

const EVENT_CAPACITY: usize = 1024;

/// A single-threaded proxy engine.
pub struct Engine {
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    core: Core,
    shutdown: Shutdown,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        mut listeners: Vec<Listener>,
        shutdown: Shutdown,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        shutdown.register(Arc::new(Waker::new(poll.registry(), WAKER)?));
        for (i, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(FIRST_LISTENER + i), Interest::READABLE)?;
        }
        let core = Core::new(
            poll.registry().try_clone()?,
            settings,
            FIRST_LISTENER + listeners.len(),
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listeners,
            core,
            shutdown,
        })
    }

    /// Runs an engine on its own thread. The engine is built on that thread
    /// because its connections are not `Send`.
    pub fn spawn(
        name: String,
        settings: EngineSettings,
        listeners: Vec<Listener>,
        shutdown: Shutdown,
    ) -> io::Result<JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name(name)
            .spawn(move || Engine::new(settings, listeners, shutdown)?.run())
    }

    /// Runs until shutdown was triggered and every connection finished.
    pub fn run(mut self) -> io::Result<()> {
        tracing::info!(
            listeners = self.listeners.len(),
            reactor = self.core.settings.reactor.as_str(),
            expiry_threshold = self.core.threshold(),
            "Engine started"
        );

        loop {
            if self.shutdown.is_triggered() && !self.core.quitting {
                self.quit();
            }
            if self.listeners.is_empty() && self.core.is_empty() {
                break;
            }

            self.core.now = Instant::now();
            if self.core.interest_len() >= self.core.threshold() {
                self.core.expire_pressure();
            }
            self.core.sweep();

            let timeout = self.core.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if self.listeners.is_empty() {
                    self.core.expire_quit();
                } else {
                    tracing::error!(error = %e, "Poll failed");
                }
                continue;
            }

            self.core.now = Instant::now();
            let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in ready {
                if token == WAKER {
                    continue;
                }
                if token.0 >= FIRST_LISTENER && token.0 < FIRST_LISTENER + self.listeners.len() {
                    self.accept(token.0 - FIRST_LISTENER);
                } else if self.core.is_waiting(token) {
                    self.core.resume(token);
                }
            }
            self.core.run_queued();
            metrics::set_interest_set_size(self.core.interest_len());
        }

        tracing::info!("Engine stopped");
        Ok(())
    }

    /// Accepts until the listener would block.
    fn accept(&mut self, index: usize) {
        let Some(listener) = self.listeners.get(index) else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.core.start_client(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_descriptor_exhaustion(&e) => {
                    // Not retried: another engine or machine may take it.
                    if let Err(e) = self.core.expire_forced(e) {
                        tracing::warn!(error = %e, "Accept failed, nothing to reclaim");
                    }
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    /// Stops accepting and reclaims idle connections; in-flight ones finish.
    fn quit(&mut self) {
        for mut listener in self.listeners.drain(..) {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                tracing::debug!(error = %e, "Listener deregister failed");
            }
        }
        self.core.quitting = true;
        let reclaimed = self.core.expire_quit();
        tracing::info!(
            reclaimed,
            in_flight = self.core.interest_len(),
            "Engine draining"
        );
    }
}
