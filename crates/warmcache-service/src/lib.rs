//! Keeps a process-local cache warm across restarts.
//!
//! The cache engine lives inside each worker's private memory, so workers cannot share it. Instead,
//! its contents are periodically dumped into a snapshot file, and every freshly started worker
//! loads that snapshot. See the [`snapshot`] module for the coordination protocol between the many
//! readers and the single snapshot writer.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod engine;
pub mod logging;
pub mod snapshot;
pub mod trigger;
