//! Prometheus metrics for the reconciliation engine
//!
//! Scheduler, executor and cascade counters, plus the HTTP endpoint that
//! serves them.

mod prometheus;

pub use prometheus::*;
