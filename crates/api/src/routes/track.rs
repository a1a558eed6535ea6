//! Direct analytics endpoint

use axum::{extract::State, http::HeaderMap, Json};

use crate::{
    analytics::{RequestContext, TrackingEvent},
    auth::MaybeAuthUser,
    error::ApiResult,
    state::AppState,
};

/// Record an event and echo it back; unlike handler emissions this waits for the sink
pub async fn track(
    State(state): State<AppState>,
    MaybeAuthUser(auth_user): MaybeAuthUser,
    headers: HeaderMap,
    Json(event): Json<TrackingEvent>,
) -> ApiResult<Json<TrackingEvent>> {
    let context = RequestContext::from_headers(&headers);
    let email = auth_user.as_ref().map(|user| user.email.as_str());

    state.tracker.track(&event, &context, email).await?;

    Ok(Json(event))
}
