//! The state shared by all requests of the refresher.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use warmcache_service::config::Config;
use warmcache_service::engine::MemoryEngine;
use warmcache_service::snapshot::{SnapshotError, SnapshotStore};
use warmcache_service::trigger::TriggerParams;

#[derive(Debug, Clone)]
pub struct Service {
    config: Arc<Config>,
    engine: Arc<MemoryEngine>,
}

impl Service {
    pub fn new(config: Config, engine: Arc<MemoryEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// The refresher's own configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Loads the existing snapshot into the engine, if there is one.
    ///
    /// The refresher is the one regenerating snapshots, so this never triggers a refresh. A
    /// missing or unreadable snapshot leaves the engine empty.
    pub fn warm_up(&self) {
        let store = SnapshotStore::new(&self.config.usercache_dump);
        match store.load(self.engine.as_ref()) {
            Ok(entries) => tracing::info!(
                "Loaded {} entries from snapshot `{}`",
                entries,
                store.path().display()
            ),
            Err(SnapshotError::NotFound) => {
                tracing::info!("No snapshot at `{}`, starting cold", store.path().display())
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, "Failed to load snapshot, starting cold");
            }
        }
    }

    /// Builds the configuration to act on for a trigger request.
    ///
    /// Only snapshot settings are taken from the request. Everything else, most importantly the
    /// secret, always comes from the refresher's own configuration.
    ///
    /// `usercache_dump` is one of those settings and is not confined to any directory. An
    /// authenticated request can point it at any file this process may write.
    pub fn request_config(&self, params: &TriggerParams) -> Result<Config> {
        let mut config = Config::clone(&self.config);

        if let Some(ref path) = params.conf_path {
            let requested = load_config_file(path)?;
            config = config.with_inline(&requested.inline_subset());
        }

        if let Some(inline) = params
            .inline_config()
            .context("failed to parse inline configuration")?
        {
            config = config.with_inline(&inline);
        }

        Ok(config)
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    Config::get(Some(path))
        .with_context(|| format!("failed to load configuration `{}`", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warmcache_service::config::InlineConfig;

    use super::*;

    fn service() -> Service {
        let config = Config {
            secret: Some("abc123".into()),
            usercache_dump: "/tmp/refresher.dump".into(),
            ..Default::default()
        };
        Service::new(config, Arc::default())
    }

    #[test]
    fn test_request_config_defaults_to_own() {
        let config = service().request_config(&TriggerParams::default()).unwrap();
        assert_eq!(config.usercache_dump, Path::new("/tmp/refresher.dump"));
        assert_eq!(config.secret.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_request_config_from_file() {
        let dir = warmcache_test::tempdir();
        let path = dir.path().join("worker.yml");
        std::fs::write(
            &path,
            "secret: other\nusercache_dump: /tmp/worker.dump\nusercache_max_age: 1m\n",
        )
        .unwrap();

        let params = TriggerParams {
            conf_path: Some(path),
            ..Default::default()
        };
        let config = service().request_config(&params).unwrap();
        assert_eq!(config.usercache_dump, Path::new("/tmp/worker.dump"));
        assert_eq!(config.usercache_max_age, Duration::from_secs(60));
        assert_eq!(config.secret.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_request_config_inline() {
        let inline = InlineConfig {
            usercache_dump: "/tmp/inline.dump".into(),
            usercache_max_age: None,
            usercache_min_size: Some(10),
        };
        let params = TriggerParams {
            conf: Some(serde_json::to_string(&inline).unwrap()),
            ..Default::default()
        };
        let config = service().request_config(&params).unwrap();
        assert_eq!(config.usercache_dump, Path::new("/tmp/inline.dump"));
        assert_eq!(config.usercache_max_age, Duration::from_secs(600));
        assert_eq!(config.usercache_min_size, 10);
    }

    #[test]
    fn test_request_config_invalid() {
        let params = TriggerParams {
            conf_path: Some("/does/not/exist.yml".into()),
            ..Default::default()
        };
        let err = service().request_config(&params).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"failed to load configuration `/does/not/exist.yml`");

        let params = TriggerParams {
            conf: Some("{not json".into()),
            ..Default::default()
        };
        let err = service().request_config(&params).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"failed to parse inline configuration");
    }
}
