//! The request/response protocol between workers and the refresher.
//!
//! A worker asks the refresher to run a [`TriggerCommand`] with a single `GET` request. The query
//! carries the command, the shared secret, and enough configuration for the refresher to find the
//! worker's snapshot. The refresher answers `OK` along with the [`RefreshOutcome`] in the
//! [`OUTCOME_HEADER`], or an error status with a JSON `detail` message.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::config::{Config, ConfigSource, InlineConfig};
use crate::snapshot::{RefreshOutcome, RefreshTrigger};

/// Response header carrying the [`RefreshOutcome`] of a successful request.
pub const OUTCOME_HEADER: &str = "x-refresh-outcome";

/// The closed set of commands a refresher accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Regenerate the snapshot if it is stale.
    SaveUserCache,
}

impl TriggerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaveUserCache => "saveusercache",
        }
    }
}

impl fmt::Display for TriggerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerCommand {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(Self::SaveUserCache.as_str()) {
            Ok(Self::SaveUserCache)
        } else {
            Err(TriggerError::UnknownCommand(s.to_owned()))
        }
    }
}

/// Query parameters of a trigger request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerParams {
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Configuration file the refresher should load the snapshot settings from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf_path: Option<PathBuf>,
    /// JSON encoded [`InlineConfig`], for workers without a configuration file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
}

impl TriggerParams {
    /// Decodes the inline configuration, if any was sent.
    pub fn inline_config(&self) -> Result<Option<InlineConfig>, serde_json::Error> {
        self.conf.as_deref().map(serde_json::from_str).transpose()
    }
}

/// Checks a provided secret against the expected one.
///
/// No configured secret accepts everything. Otherwise, a missing and a wrong secret are rejected
/// alike, and the comparison time does not depend on where the secrets differ.
pub fn verify_secret(expected: Option<&str>, provided: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(provided) = provided else {
        return false;
    };

    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, Error)]
pub enum TriggerError {
    /// There is no usable refresher endpoint configured.
    #[error("invalid trigger configuration: {0}")]
    Configuration(String),
    /// The refresher rejected the secret.
    #[error("the refresher requires a valid secret")]
    Authentication,
    /// The refresher does not know the requested command.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    /// The refresher could not be reached or did not answer in time.
    #[error("failed to reach the refresher")]
    Transport(#[from] reqwest::Error),
    /// The refresher answered with an error.
    #[error("the refresher failed with {status}: {detail}")]
    Rejected { status: StatusCode, detail: String },
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    detail: Option<String>,
}

/// Asks a (possibly remote) refresher to regenerate the snapshot.
///
/// Requests are not retried, that is up to the caller.
#[derive(Debug, Clone)]
pub struct RemoteTrigger {
    client: reqwest::Client,
    url: Option<Url>,
    secret: Option<String>,
    source: ConfigSource,
    inline: InlineConfig,
}

impl RemoteTrigger {
    pub fn from_config(config: &Config) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(config.trigger_timeout)
            .build()
            .map_err(|err| TriggerError::Configuration(err.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
            source: config.source.clone(),
            inline: config.inline_subset(),
        })
    }

    /// Builds the query parameters for `command`.
    pub fn params(&self, command: TriggerCommand) -> TriggerParams {
        let mut params = TriggerParams {
            cmd: Some(command.as_str().to_owned()),
            secret: self.secret.clone(),
            ..Default::default()
        };

        match self.source {
            ConfigSource::Default => {}
            ConfigSource::File(ref path) => params.conf_path = Some(path.clone()),
            ConfigSource::Inline => {
                // serializing plain paths and numbers does not fail
                params.conf = serde_json::to_string(&self.inline).ok();
            }
        }

        params
    }

    async fn send(&self, command: TriggerCommand) -> Result<RefreshOutcome, TriggerError> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| TriggerError::Configuration("no refresher `url` configured".into()))?;

        tracing::debug!("Requesting `{}` from {}", command, url);
        let response = self
            .client
            .get(url)
            .query(&self.params(command))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let outcome = response
                .headers()
                .get(OUTCOME_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            return outcome.ok_or_else(|| TriggerError::Rejected {
                status,
                detail: format!("response without a valid `{OUTCOME_HEADER}` header"),
            });
        }

        let body = response.text().await?;
        let detail = serde_json::from_str::<ErrorDetail>(&body)
            .ok()
            .and_then(|error| error.detail)
            .unwrap_or(body);

        Err(match status {
            StatusCode::FORBIDDEN => TriggerError::Authentication,
            StatusCode::BAD_REQUEST => TriggerError::UnknownCommand(command.as_str().to_owned()),
            _ => TriggerError::Rejected { status, detail },
        })
    }
}

#[async_trait]
impl RefreshTrigger for RemoteTrigger {
    async fn request_refresh(
        &self,
        command: TriggerCommand,
    ) -> Result<RefreshOutcome, TriggerError> {
        let result = self.send(command).await;
        let tag = match result {
            Ok(_) => "ok",
            Err(TriggerError::Transport(_)) => "transport",
            Err(_) => "rejected",
        };
        metric!(counter("trigger.request") += 1, "result" => tag);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;

    use super::*;

    #[test]
    fn test_verify_secret() {
        assert!(verify_secret(None, None));
        assert!(verify_secret(None, Some("anything")));
        assert!(verify_secret(Some("abc123"), Some("abc123")));
        assert!(!verify_secret(Some("abc123"), Some("abc124")));
        assert!(!verify_secret(Some("abc123"), Some("abc1234")));
        assert!(!verify_secret(Some("abc123"), None));
        assert!(!verify_secret(Some(""), Some("x")));
        // an empty secret is still a secret
        assert!(verify_secret(Some(""), Some("")));
        assert!(!verify_secret(Some(""), None));
    }

    #[test]
    fn test_command_lookup() {
        assert_eq!(
            "saveusercache".parse::<TriggerCommand>().unwrap(),
            TriggerCommand::SaveUserCache
        );
        assert_eq!(
            "SaveUserCache".parse::<TriggerCommand>().unwrap(),
            TriggerCommand::SaveUserCache
        );
        let err = "__construct".parse::<TriggerCommand>().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"unknown command `__construct`");
    }

    #[test]
    fn test_params_by_config_source() {
        let config = Config {
            secret: Some("abc123".into()),
            usercache_dump: "/tmp/usercache.dump".into(),
            ..Default::default()
        };

        let trigger = RemoteTrigger::from_config(&config).unwrap();
        let params = trigger.params(TriggerCommand::SaveUserCache);
        assert_eq!(params.cmd.as_deref(), Some("saveusercache"));
        assert_eq!(params.secret.as_deref(), Some("abc123"));
        assert_eq!(params.conf_path, None);
        assert_eq!(params.conf, None);

        let trigger = RemoteTrigger::from_config(&config.clone().inline()).unwrap();
        let params = trigger.params(TriggerCommand::SaveUserCache);
        assert_eq!(params.conf_path, None);
        let inline = params.inline_config().unwrap().unwrap();
        assert_eq!(inline.usercache_dump, PathBuf::from("/tmp/usercache.dump"));
        assert_eq!(inline.usercache_max_age, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_missing_url() {
        let trigger = RemoteTrigger::from_config(&Config::default()).unwrap();
        let err = trigger
            .request_refresh(TriggerCommand::SaveUserCache)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Configuration(_)));
    }

    fn config_for(server: &warmcache_test::Server) -> Config {
        Config {
            url: Some(server.url("/")),
            secret: Some("abc123".into()),
            trigger_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_refresh() {
        warmcache_test::setup();
        let seen = Arc::new(Mutex::new(None));
        let router = {
            let seen = seen.clone();
            Router::new().route(
                "/",
                get(move |Query(params): Query<TriggerParams>| async move {
                    *seen.lock().unwrap() = Some(params);
                    ([(OUTCOME_HEADER, "published")], "OK")
                }),
            )
        };
        let server = warmcache_test::Server::with_router(router);

        let trigger = RemoteTrigger::from_config(&config_for(&server)).unwrap();
        let outcome = trigger
            .request_refresh(TriggerCommand::SaveUserCache)
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Published);

        let params = seen.lock().unwrap().take().unwrap();
        assert_eq!(params.cmd.as_deref(), Some("saveusercache"));
        assert_eq!(params.secret.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        warmcache_test::setup();
        let router = Router::new()
            .route(
                "/forbidden/",
                get(|| async { (HttpStatus::FORBIDDEN, r#"{"detail":"nope"}"#) }),
            )
            .route(
                "/unknown/",
                get(|| async { (HttpStatus::BAD_REQUEST, r#"{"detail":"unknown"}"#) }),
            )
            .route(
                "/broken/",
                get(|| async {
                    (
                        HttpStatus::INTERNAL_SERVER_ERROR,
                        r#"{"detail":"snapshot refresh failed while regenerating"}"#,
                    )
                }),
            )
            .route("/legacy/", get(|| async { "OK" }));
        let server = warmcache_test::Server::with_router(router);

        let request = |path: &str| {
            let config = Config {
                url: Some(server.url(path)),
                ..config_for(&server)
            };
            async move {
                RemoteTrigger::from_config(&config)
                    .unwrap()
                    .request_refresh(TriggerCommand::SaveUserCache)
                    .await
                    .unwrap_err()
            }
        };

        assert!(matches!(request("/forbidden/").await, TriggerError::Authentication));
        assert!(matches!(request("/unknown/").await, TriggerError::UnknownCommand(_)));

        let err = request("/broken/").await;
        insta::assert_snapshot!(err.to_string(), @"the refresher failed with 500 Internal Server Error: snapshot refresh failed while regenerating");

        let err = request("/legacy/").await;
        assert!(matches!(err, TriggerError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_transport_error() {
        warmcache_test::setup();
        let server = warmcache_test::Server::with_router(Router::new());
        let config = config_for(&server);
        // nothing listens there anymore
        drop(server);

        let trigger = RemoteTrigger::from_config(&config).unwrap();
        let err = trigger
            .request_refresh(TriggerCommand::SaveUserCache)
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        warmcache_test::setup();
        let router = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "OK"
            }),
        );
        let server = warmcache_test::Server::with_router(router);

        let trigger = RemoteTrigger::from_config(&Config {
            trigger_timeout: Duration::from_millis(100),
            ..config_for(&server)
        })
        .unwrap();
        let err = trigger
            .request_refresh(TriggerCommand::SaveUserCache)
            .await
            .unwrap_err();
        match err {
            TriggerError::Transport(err) => assert!(err.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
