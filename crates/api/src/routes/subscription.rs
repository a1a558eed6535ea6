//! Subscribe and unsubscribe form endpoints

use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    response::Response,
    Form,
};
use serde::Deserialize;

use crate::{
    analytics::{source_from_ref, RequestContext, TrackingEvent},
    auth::AuthUser,
    error::ApiResult,
    routes::{checkpoint_new_customer, redirect_to_dashboard},
    state::AppState,
};

/// Form posted by the card widget
#[derive(Debug, Default, Deserialize)]
pub struct SubscribeForm {
    #[serde(rename = "stripeToken", default)]
    pub stripe_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefQuery {
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

/// Attach a card, subscribe if needed and end the trial
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
    Query(query): Query<RefQuery>,
    Form(form): Form<SubscribeForm>,
) -> ApiResult<Response> {
    let _guard = state.locks.lock(&auth_user.email).await;
    let mut account = state.store.get_by_email(&auth_user.email, true).await?;
    let before = account.clone();

    let outcome = match state
        .billing
        .subscriptions
        .subscribe(&mut account, &form.stripe_token)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            checkpoint_new_customer(&state, &before, &account).await;
            return Err(e.into());
        }
    };

    state.store.put(&account).await?;

    tracing::info!(
        email = %account.email,
        action = outcome.action(),
        "subscribe"
    );

    let plan = account
        .subscription()
        .and_then(|s| s.plan_id())
        .unwrap_or(state.billing.subscriptions.default_plan())
        .to_string();

    state.tracker.dispatch(
        TrackingEvent::new(outcome.event_name())
            .property("Plan", plan)
            .property(
                "Source",
                source_from_ref(query.reference.as_deref().unwrap_or_default()),
            )
            .tracking_id(Some(account.tracking_id.clone())),
        RequestContext::from_headers(&headers),
        Some(account.email.clone()),
    );

    Ok(redirect_to_dashboard(outcome.action()))
}

/// Cancel the caller's subscription
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let _guard = state.locks.lock(&auth_user.email).await;
    let mut account = state.store.get_by_email(&auth_user.email, true).await?;

    let subscription = state.billing.subscriptions.unsubscribe(&mut account).await?;
    state.store.put(&account).await?;

    tracing::info!(
        email = %account.email,
        subscription_id = %subscription.id,
        "unsubscribe"
    );

    state.tracker.dispatch(
        TrackingEvent::new("Cancel Subscription")
            .property("Plan", subscription.plan_id().unwrap_or_default())
            .tracking_id(Some(account.tracking_id.clone())),
        RequestContext::from_headers(&headers),
        Some(account.email.clone()),
    );

    Ok(redirect_to_dashboard("unsubscribed"))
}
