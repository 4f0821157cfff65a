use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use warmcache_service::snapshot::RefreshCoordinator;
use warmcache_service::trigger::{OUTCOME_HEADER, TriggerCommand, TriggerParams, verify_secret};

use crate::service::Service;

use super::ResponseError;

/// Runs a [`TriggerCommand`] on behalf of a worker.
///
/// The secret is verified before anything else is looked at.
pub async fn handle_trigger_request(
    State(service): State<Service>,
    Query(params): Query<TriggerParams>,
) -> Result<Response, ResponseError> {
    if !verify_secret(service.config().secret.as_deref(), params.secret.as_deref()) {
        tracing::debug!("Rejected trigger request with an invalid secret");
        return Err(ResponseError::forbidden());
    }

    let command: TriggerCommand = params
        .cmd
        .as_deref()
        .ok_or((StatusCode::BAD_REQUEST, "missing command"))?
        .parse()?;

    let config = service
        .request_config(&params)
        .map_err(|err| (StatusCode::UNPROCESSABLE_ENTITY, err))?;

    let outcome = match command {
        TriggerCommand::SaveUserCache => {
            RefreshCoordinator::from_config(&config)
                .refresh(service.engine().clone())
                .await?
        }
    };

    Ok(([(OUTCOME_HEADER, outcome.as_str())], "OK").into_response())
}
