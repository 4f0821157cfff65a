use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use warmcache_service::config::Config;
use warmcache_service::engine::MemoryEngine;

use crate::endpoints;
use crate::service::Service;

/// Starts the refresher's HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    warmcache_service::metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("warmcache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    // Requests may name `usercache_dump` through `conf` or `conf_path`, so whoever holds the
    // secret can make the refresher write a snapshot to any path it has write access to.
    if config.secret.is_none() {
        tracing::warn!(
            "No secret configured, anyone who can reach {} may trigger refreshes \
             and choose where the snapshot is written",
            config.bind
        );
    }

    let socket_http = config
        .bind
        .parse::<SocketAddr>()
        .context("invalid bind address")?;

    let service = Service::new(config, Arc::new(MemoryEngine::new()));
    service.warm_up();

    let server_http =
        axum_server::bind(socket_http).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket_http);

    web_pool.block_on(server_http)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
