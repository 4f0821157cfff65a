use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::snapshot::StalenessThresholds;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for warmcache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "warmcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds the busy-wait of a writer that finds the snapshot lock taken.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LockWaitConfig {
    /// Sleep between two polls of the lock marker.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Total time to wait for the lock, across all polls.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for LockWaitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Where a [`Config`] came from.
///
/// A remote refresher needs to see the same snapshot settings as the worker asking it for a
/// refresh. Workers configured from a file send that path along, workers configured in memory
/// send an [`InlineConfig`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults, nothing needs to be forwarded.
    #[default]
    Default,
    /// Loaded from the given configuration file.
    File(PathBuf),
    /// Assembled in memory by the embedding process.
    Inline,
}

/// The minimal subset of the configuration a refresher needs to act on a worker's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineConfig {
    /// Path of the snapshot file.
    pub usercache_dump: PathBuf,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub usercache_max_age: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usercache_min_size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the refresher's HTTP endpoint to.
    pub bind: String,

    /// Base URL of the refresher that regenerates snapshots on behalf of workers.
    pub url: Option<Url>,

    /// Shared secret that authenticates refresh requests.
    ///
    /// When not configured a random secret is generated, which effectively locks down the
    /// endpoint. Setting this to `null` explicitly opens the endpoint to anyone who can reach it.
    pub secret: Option<String>,

    /// Path of the snapshot file.
    pub usercache_dump: PathBuf,

    /// Snapshots older than this are stale.
    #[serde(with = "humantime_serde")]
    pub usercache_max_age: Duration,

    /// Snapshots smaller than this many bytes are stale. `0` disables the check.
    pub usercache_min_size: u64,

    /// Polling of a lock held by another writer.
    pub lock_wait: LockWaitConfig,

    /// Timeout of a single refresh request sent to the refresher.
    #[serde(with = "humantime_serde")]
    pub trigger_timeout: Duration,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Where this configuration was loaded from, forwarded to the refresher on triggers.
    #[serde(skip)]
    pub source: ConfigSource,
}

fn random_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1:3031".to_owned(),
            url: None,
            secret: Some(random_secret()),
            usercache_dump: PathBuf::from("/dev/shm/warmcache-usercache.dump"),
            usercache_max_age: Duration::from_secs(600),
            usercache_min_size: 0,
            lock_wait: LockWaitConfig::default(),
            trigger_timeout: Duration::from_secs(30),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            source: ConfigSource::Default,
        }
    }
}

impl Config {
    /// Loads the configuration file at `path`, or falls back to the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::from_reader(
                    fs::File::open(path).context("failed to open configuration file")?,
                )?;
                let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
                config.source = ConfigSource::File(path);
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    /// Marks this configuration as assembled in memory.
    pub fn inline(mut self) -> Self {
        self.source = ConfigSource::Inline;
        self
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        StalenessThresholds {
            max_age: self.usercache_max_age,
            min_size: self.usercache_min_size,
        }
    }

    /// Extracts the settings a refresher needs to act on this configuration's snapshot.
    pub fn inline_subset(&self) -> InlineConfig {
        InlineConfig {
            usercache_dump: self.usercache_dump.clone(),
            usercache_max_age: Some(self.usercache_max_age),
            usercache_min_size: Some(self.usercache_min_size),
        }
    }

    /// Overlays an [`InlineConfig`] sent by a worker onto this configuration.
    pub fn with_inline(&self, inline: &InlineConfig) -> Self {
        let mut config = self.clone();
        config.usercache_dump = inline.usercache_dump.clone();
        if let Some(max_age) = inline.usercache_max_age {
            config.usercache_max_age = max_age;
        }
        if let Some(min_size) = inline.usercache_min_size {
            config.usercache_min_size = min_size;
        }
        config
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_snapshot_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.usercache_max_age, Duration::from_secs(600));
        assert_eq!(cfg.usercache_min_size, 0);
        assert_eq!(cfg.source, ConfigSource::Default);

        let yaml = r#"
            usercache_dump: /tmp/users.dump
            usercache_max_age: 10m
            usercache_min_size: 1024
            lock_wait:
              timeout: 2s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.usercache_dump, PathBuf::from("/tmp/users.dump"));
        assert_eq!(
            cfg.thresholds(),
            StalenessThresholds {
                max_age: Duration::from_secs(600),
                min_size: 1024,
            }
        );
        assert_eq!(cfg.lock_wait.timeout, Duration::from_secs(2));
        assert_eq!(cfg.lock_wait.interval, Duration::from_millis(10));
    }

    #[test]
    fn test_secret_defaults_to_random() {
        let first = Config::default();
        let second = Config::default();
        assert!(first.secret.is_some());
        assert_ne!(first.secret, second.secret);

        let cfg = Config::from_reader("bind: 127.0.0.1:4000".as_bytes()).unwrap();
        assert!(cfg.secret.is_some());
    }

    #[test]
    fn test_secret_explicitly_disabled() {
        let cfg = Config::from_reader("secret: null".as_bytes()).unwrap();
        assert_eq!(cfg.secret, None);

        let cfg = Config::from_reader("secret: abc123".as_bytes()).unwrap();
        assert_eq!(cfg.secret.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_logging_level() {
        let cfg = Config::from_reader("logging: { level: debug }".as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);

        let result = Config::from_reader("logging: { level: loud }".as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            usercache_dmp: /tmp/typo.dump
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_file_source_recorded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "usercache_dump: /tmp/from-file.dump").unwrap();

        let cfg = Config::get(Some(file.path())).unwrap();
        let expected = fs::canonicalize(file.path()).unwrap();
        assert_eq!(cfg.source, ConfigSource::File(expected));

        let cfg = Config::default().inline();
        assert_eq!(cfg.source, ConfigSource::Inline);
    }

    #[test]
    fn test_inline_overlay() {
        let base = Config {
            usercache_min_size: 100,
            ..Default::default()
        };
        let inline: InlineConfig =
            serde_json::from_str(r#"{"usercache_dump":"/tmp/inline.dump"}"#).unwrap();
        let cfg = base.with_inline(&inline);
        assert_eq!(cfg.usercache_dump, PathBuf::from("/tmp/inline.dump"));
        assert_eq!(cfg.usercache_min_size, 100);
        assert_eq!(cfg.secret, base.secret);

        let subset = cfg.inline_subset();
        let json = serde_json::to_string(&subset).unwrap();
        insta::assert_snapshot!(json, @r#"{"usercache_dump":"/tmp/inline.dump","usercache_max_age":"10m","usercache_min_size":100}"#);
    }
}
