//! Public listener sockets.
//!
//! # Responsibilities
//! - Bind configured addresses once at startup (blocking std sockets)
//! - Hand each engine its own non-blocking clone
//! - Accept without blocking, reporting the peer for `X-Forwarded-For`

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::net::UnixListener as StdUnixListener;

use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use mio::{Interest, Registry, Token};

use crate::net::{Endpoint, Stream};

/// Address reported for peers that have no IP (Unix-domain clients).
pub const LOCAL_PEER: &str = "127.0.0.1";

/// A bound listener that has not been given to an engine yet.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(StdTcpListener),
    Unix(StdUnixListener),
}

impl BoundListener {
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        let listener = match endpoint {
            Endpoint::Tcp(addr) => BoundListener::Tcp(StdTcpListener::bind(addr)?),
            Endpoint::Unix(path) => BoundListener::Unix(StdUnixListener::bind(path)?),
        };
        tracing::info!(address = %endpoint, "Listener bound");
        Ok(listener)
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            BoundListener::Tcp(l) => l.local_addr().map(Endpoint::Tcp),
            BoundListener::Unix(l) => {
                let addr = l.local_addr()?;
                let path = addr
                    .as_pathname()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnamed socket"))?;
                Ok(Endpoint::Unix(path.to_path_buf()))
            }
        }
    }

    /// A non-blocking clone sharing the same underlying socket.
    pub fn to_listener(&self) -> io::Result<Listener> {
        match self {
            BoundListener::Tcp(l) => {
                let clone = l.try_clone()?;
                clone.set_nonblocking(true)?;
                Ok(Listener::Tcp(TcpListener::from_std(clone)))
            }
            BoundListener::Unix(l) => {
                let clone = l.try_clone()?;
                clone.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(clone)))
            }
        }
    }
}

/// A non-blocking public listener owned by one engine.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accepts one connection, returning it with its peer address.
    pub fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept()?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), addr.ip().to_string()))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                Ok((Stream::Unix(stream), LOCAL_PEER.to_string()))
            }
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.register(registry, token, interests),
            Listener::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.reregister(registry, token, interests),
            Listener::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.deregister(registry),
            Listener::Unix(l) => l.deregister(registry),
        }
    }
}
