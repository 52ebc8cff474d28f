//! Control-plane reconciliation engine
//!
//! Drives every managed resource from its actual phase towards its desired
//! state. Workers claim records under time-bounded leases, run one transition
//! per claim through a pluggable driver, and propagate desired states from
//! parents to the resources they own.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod reconcilers;
pub mod resource;
pub mod store;

pub use error::{Error, Result};
