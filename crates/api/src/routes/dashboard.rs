//! Dashboard read path

use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use subledger_billing::DashboardSnapshot;

use crate::{
    analytics::{source_from_ref, RequestContext, TrackingEvent},
    auth::AuthUser,
    error::ApiResult,
    routes::checkpoint_new_customer,
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    /// Outcome tag from a preceding redirect
    pub action: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    /// Tracking ID supplied by the referring page
    pub tid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    #[serde(flatten)]
    pub snapshot: DashboardSnapshot,
    pub stripe_public_key: String,
    pub action: Option<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

/// Render the caller's billing snapshot, creating missing billing objects on first visit
pub async fn dashboard(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<Json<DashboardResponse>> {
    let snapshot = {
        let _guard = state.locks.lock(&auth_user.email).await;
        let mut account = state.store.get_by_email(&auth_user.email, true).await?;
        let before = account.clone();

        let display_subscription = state
            .config
            .subscription_policy
            .requires_subscription(&account.email);

        let snapshot = match state
            .billing
            .subscriptions
            .dashboard(&mut account, display_subscription)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                checkpoint_new_customer(&state, &before, &account).await;
                return Err(e.into());
            }
        };

        // Only a cold start changes anything here
        if account != before {
            state.store.put(&account).await?;
        }
        snapshot
    };

    let action = query.action.filter(|a| !a.is_empty());
    let reference = query
        .reference
        .filter(|r| !r.is_empty())
        .or_else(|| action.as_ref().map(|a| format!("action: {}", a)));

    let tracking_id = query
        .tid
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| snapshot.tracking_id.clone());

    state.tracker.dispatch(
        TrackingEvent::new("Open Dashboard")
            .property("Action", action.clone().unwrap_or_default())
            .property(
                "Source",
                source_from_ref(reference.as_deref().unwrap_or_default()),
            )
            .tracking_id(Some(tracking_id)),
        RequestContext::from_headers(&headers),
        Some(auth_user.email.clone()),
    );

    Ok(Json(DashboardResponse {
        snapshot,
        stripe_public_key: state.billing.public_key.clone(),
        action,
        reference,
    }))
}
