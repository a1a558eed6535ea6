//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Handle Stripe webhook events
///
/// Unrecognized event types and guarded-out deltas still answer 200. Only a
/// failure on a recognized event is a server error, so Stripe redelivers it.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    tracing::debug!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok());

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            ApiError::from(e)
        })?;

    let event_id = event.id.clone();
    let outcome = state
        .billing
        .webhooks
        .handle_event(event)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Webhook handling error");
            ApiError::from(e)
        })?;

    tracing::debug!(event_id = %event_id, applied = outcome.is_applied(), "Stripe webhook processed");

    Ok(StatusCode::OK)
}
