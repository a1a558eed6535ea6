//! HTTP routes

mod dashboard;
mod health;
mod subscription;
mod track;
mod webhook;

#[cfg(test)]
mod router_tests;

use axum::{
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use subledger_shared::Account;

use crate::{
    auth::{optional_auth, require_auth},
    state::AppState,
};

pub use dashboard::{DashboardQuery, DashboardResponse};
pub use subscription::{RefQuery, SubscribeForm};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let protected = Router::new()
        .route("/dashboard/", get(dashboard::dashboard))
        .route("/subscribe/", post(subscription::subscribe))
        .route("/unsubscribe/", post(subscription::unsubscribe))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    let optional = Router::new()
        .route("/track/", post(track::track))
        .route_layer(middleware::from_fn_with_state(auth_state, optional_auth));

    let public = Router::new()
        .route("/stripe/webhook/", post(webhook::stripe_webhook))
        .route("/health", get(health::health));

    Router::new()
        .merge(protected)
        .merge(optional)
        .merge(public)
        .with_state(state)
}

/// 302 to the dashboard carrying the outcome tag
pub(crate) fn redirect_to_dashboard(action: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("/dashboard/?action={}", action))],
    )
        .into_response()
}

/// Persist a customer created by a request that failed afterwards, so the
/// next attempt reuses it instead of creating another one
pub(crate) async fn checkpoint_new_customer(state: &AppState, before: &Account, after: &Account) {
    if before.customer.is_some() || after.customer.is_none() {
        return;
    }

    if let Err(e) = state.store.put(after).await {
        tracing::warn!(
            email = %after.email,
            customer_id = ?after.customer_id(),
            error = %e,
            "Failed to checkpoint newly created customer"
        );
    }
}
