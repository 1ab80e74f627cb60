//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listener, sessions and the service produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every per-connection event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
