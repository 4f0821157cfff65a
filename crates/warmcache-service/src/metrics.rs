//! Statsd reporting through the [`metric!`](crate::metric) macro.
use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::panic::RefUnwindSafe;
use std::sync::OnceLock;

use anyhow::Context;
use cadence::{MetricSink, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<StatsdClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

fn build_client<S>(prefix: &str, sink: S, tags: BTreeMap<String, String>) -> StatsdClient
where
    S: MetricSink + Send + Sync + RefUnwindSafe + 'static,
{
    let mut builder = StatsdClient::builder(prefix, sink);
    for (tag, value) in tags {
        builder = builder.with_tag(tag, value);
    }
    builder.build()
}

/// Reports metrics to the statsd server at `host`, with `tags` on every metric.
///
/// Only the first call installs a client, later calls are ignored.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("invalid statsd address")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)?;

    if METRICS_CLIENT.set(build_client(prefix, sink, tags)).is_err() {
        tracing::warn!("statsd client was already configured");
    }
    Ok(())
}

/// Calls `f` with the statsd client, or does nothing if statsd is not configured.
#[inline(always)]
pub fn with_client<F: FnOnce(&StatsdClient)>(f: F) {
    if let Some(client) = METRICS_CLIENT.get() {
        f(client)
    }
}

/// Emits a counter, gauge or timer with optional `"key" => value` tags.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.count_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.gauge_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            use $crate::metrics::prelude::*;
            client.time_with_tags($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
}

#[cfg(test)]
mod tests {
    use cadence::SpyMetricSink;

    use super::prelude::*;
    use super::*;

    #[test]
    fn test_default_tags() {
        let (received, sink) = SpyMetricSink::new();
        let tags = BTreeMap::from([("host".to_owned(), "worker-1".to_owned())]);
        let client = build_client("warmcache", sink, tags);

        client
            .count_with_tags("snapshot.refresh", 1)
            .with_tag("outcome", "fresh")
            .send();

        let line = String::from_utf8(received.try_recv().unwrap()).unwrap();
        assert!(line.starts_with("warmcache.snapshot.refresh:1|c|#"), "{line}");
        assert!(line.contains("outcome:fresh"), "{line}");
        assert!(line.contains("host:worker-1"), "{line}");
    }
}
