//! Reconciliation logic
//!
//! - [`executor`] runs one transition for a leased record
//! - [`retry`] turns driver outcomes into advance, retry or fail decisions
//! - [`cascade`] propagates desired states from parents to owned records

pub mod cascade;
pub mod executor;
pub mod retry;

pub use cascade::{CascadeNotifier, CascadeReport, CascadeRule, CascadeTrigger, ChangeEvent};
pub use executor::{Disposition, ExecutionReport, TransitionExecutor};
pub use retry::{Decision, RetryController, RetryPolicy};
