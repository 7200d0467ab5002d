//! Shutdown coordination for the proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mio::Waker;

/// Coordinator for graceful shutdown.
///
/// Cheap to clone; every engine keeps a copy and checks it once per reactor
/// iteration. Engines register a [`Waker`] so a blocked poll returns promptly.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine's poll waker.
    pub fn register(&self, waker: Arc<Waker>) {
        let mut wakers = self.inner.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        wakers.push(Arc::clone(&waker));
        drop(wakers);
        // Triggered before this engine existed.
        if self.is_triggered() {
            wake(&waker);
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let wakers = self.inner.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter() {
            wake(waker);
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }
}

fn wake(waker: &Waker) {
    if let Err(e) = waker.wake() {
        tracing::warn!(error = %e, "Failed to wake engine");
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
