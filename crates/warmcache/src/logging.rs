use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;
use warmcache_service::config::{Config, LogFormat};
use warmcache_service::logging::init_json_logging;

/// The `RUST_LOG` directives used when the environment does not set any.
///
/// HTTP plumbing is kept at `WARN` unless warmcache itself is traced.
fn default_directives(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO,hyper=WARN,reqwest=WARN",
        LevelFilter::DEBUG => "INFO,warmcache=DEBUG,warmcache_service=DEBUG",
        LevelFilter::TRACE => "DEBUG,warmcache=TRACE,warmcache_service=TRACE",
    }
}

/// Installs the global subscriber, with a sentry layer next to the formatted output.
///
/// `RUST_LOG` wins over `logging.level`. `logging.enable_backtraces` sets `RUST_BACKTRACE`.
///
/// # Safety
/// Writes the environment with [`std::env::set_var`], so no other thread may be running.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees we are still single-threaded.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_directives(config.logging.level).to_owned());

    let pretty = match config.logging.format {
        LogFormat::Json => return init_json_logging(&directives, std::io::stdout),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended(),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt_layer = if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    };

    // errors are reported as events, INFO and WARN only travel along as breadcrumbs
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&directives)))
        .with(sentry_layer)
        .init();
}

/// Reports a fatal error through tracing, or on `stderr` before logging is set up.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::dispatcher::has_been_set() {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
