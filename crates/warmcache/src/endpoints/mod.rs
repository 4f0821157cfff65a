use axum::Router;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use crate::service::Service;

mod error;
mod trigger;

pub use error::ResponseError;

use trigger::handle_trigger_request as trigger;

pub async fn healthcheck() -> &'static str {
    warmcache_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Service) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction());
    Router::new()
        .route("/", get(trigger))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warmcache_service::config::Config;

    use super::*;

    #[tokio::test]
    async fn test_healthcheck() {
        warmcache_test::setup();
        let service = Service::new(Config::default(), Arc::default());
        let server = warmcache_test::Server::with_router(create_app(service));

        let response = reqwest::get(server.url("/healthcheck")).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "ok");
    }
}
