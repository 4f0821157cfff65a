//! Warmcache.
//!
//! Warmcache keeps the in-memory caches of short-lived workers warm across restarts. A single
//! refresher periodically dumps its cache into a snapshot file, and every newly started worker
//! loads that snapshot instead of starting cold. This binary runs the refresher's HTTP endpoint
//! and provides maintenance commands for snapshots.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cleanup;
mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
