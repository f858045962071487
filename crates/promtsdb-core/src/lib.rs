//! promtsdb-core - scrape, convert and forward Prometheus metrics to OpenTSDB.
//!
//! Provides:
//! - `collector` - periodic scraping of a metrics endpoint on a Unix socket
//! - `queue` - bounded FIFO between collector and forwarder
//! - `forwarder` - conversion and delivery of wire lines (TCP or stdout)
//! - `lifecycle` - idempotent start gate for the collector
//! - `control` - Docker plugin control plane (axum on a Unix socket)
//! - `exposition` - Prometheus text format parser
//! - `opentsdb` - OpenTSDB `put` line encoder
//! - `model` - metric family records
//! - `util` - helper utilities
//!
//! ```text
//!   metrics.sock ──GET /metrics──▶ Collector ──push──▶ Queue(1024) ──pop──▶ Forwarder ──▶ OpenTSDB
//!                                      ▲                                         (stdout in dry run)
//!   plugin sock ──StartMetrics──▶ Lifecycle
//! ```

pub mod collector;
pub mod control;
pub mod exposition;
pub mod forwarder;
pub mod lifecycle;
pub mod model;
pub mod opentsdb;
pub mod queue;
pub mod util;

/// Crate version with the git revision it was built from.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");
