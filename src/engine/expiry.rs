//! Backpressure and expiry policy.
//!
//! # Triggers
//! ```text
//! interest set ≥ threshold   → Pressure   (cutoff = now − keepalive)
//! periodic sweep             → Deadline   (cutoff = now)
//! EMFILE/ENFILE/ENOBUFS/...  → Exhausted  (cutoff relaxed 1s per pass)
//! graceful shutdown          → Quit       (cutoff = now − keepalive, plus idle)
//! ```
//!
//! # Design Decisions
//! - Only connections in the interest set carry a deadline; parked ones are
//!   never reclaimed here
//! - Reclaimed connections go through their own failure path so the
//!   counterpart unwinds as well
//! - A forced pass that reclaims nothing hands the original error back

use std::io;
use std::time::{Duration, Instant};

use mio::Token;

use crate::engine::core::Core;
use crate::error::ProxyError;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Pressure,
    Deadline,
    Exhausted,
    Quit,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::Pressure => "pressure",
            ExpiryReason::Deadline => "deadline",
            ExpiryReason::Exhausted => "exhausted",
            ExpiryReason::Quit => "quit",
        }
    }
}

impl Core {
    /// Reclaims every waiting connection whose deadline is before `cutoff`
    /// (and, when quitting, every idle one). Returns how many were reclaimed.
    pub fn expire_before(&mut self, cutoff: Instant, reason: ExpiryReason) -> usize {
        let quit = reason == ExpiryReason::Quit;
        let doomed: Vec<Token> = self
            .interest
            .iter()
            .filter(|(token, wait)| {
                wait.deadline < cutoff
                    || (quit && self.conns.get(token).is_some_and(|c| c.is_idle()))
            })
            .map(|(token, _)| *token)
            .collect();

        let mut reclaimed = 0;
        for token in doomed {
            self.interest.remove(&token);
            // A counterpart reclaimed earlier in this pass is already gone.
            let Some(mut conn) = self.conns.remove(&token) else {
                continue;
            };
            conn.fail(self, ProxyError::Expired);
            self.restore(conn);
            reclaimed += 1;
        }

        if reclaimed > 0 {
            metrics::record_reaped(reason.as_str(), reclaimed);
            tracing::debug!(reason = reason.as_str(), reclaimed, "Expired connections");
        }
        reclaimed
    }

    /// Opportunistic pass once the interest set grew past the threshold.
    pub fn expire_pressure(&mut self) -> usize {
        match self.keepalive_cutoff(Duration::ZERO) {
            Some(cutoff) => self.expire_before(cutoff, ExpiryReason::Pressure),
            None => 0,
        }
    }

    /// Reclaims connections whose own deadline already passed.
    pub fn expire_overdue(&mut self) -> usize {
        self.expire_before(self.now, ExpiryReason::Deadline)
    }

    /// Graceful-shutdown pass: stale and idle connections go.
    pub fn expire_quit(&mut self) -> usize {
        let cutoff = self.keepalive_cutoff(Duration::ZERO).unwrap_or(self.now);
        self.expire_before(cutoff, ExpiryReason::Quit)
    }

    /// Descriptor exhaustion: relax the cutoff one second at a time until
    /// something is reclaimed. Returns `err` if nothing can be.
    pub fn expire_forced(&mut self, err: io::Error) -> io::Result<()> {
        let limit = self.settings.timeouts.keepalive.as_secs();
        for relax in 0..=limit {
            let Some(cutoff) = self.keepalive_cutoff(Duration::from_secs(relax)) else {
                continue;
            };
            if self.expire_before(cutoff, ExpiryReason::Exhausted) > 0 {
                tracing::warn!(
                    error = %err,
                    relaxed_secs = relax,
                    "Reclaimed connections under descriptor pressure"
                );
                return Ok(());
            }
        }
        tracing::warn!(
            error = %err,
            waiting = self.interest_len(),
            "Nothing to reclaim under descriptor pressure"
        );
        Err(err)
    }

    /// `now − keepalive + relax`, or None before the clock can go that far back.
    fn keepalive_cutoff(&self, relax: Duration) -> Option<Instant> {
        let age = self.settings.timeouts.keepalive.saturating_sub(relax);
        self.now.checked_sub(age)
    }
}
