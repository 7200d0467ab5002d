//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Engines, lifecycle and config produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges via the metrics facade)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection IDs flow through every per-connection event
//! - Metrics are cheap (atomic increments); without an installed recorder
//!   they are no-ops
pub mod logging;
pub mod metrics;
