// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Router tests
//!
//! Drive the full router against a scripted provider and the in-memory store:
//! - Dashboard cold start, idempotent reload and ref/tracking handling
//! - Subscribe/unsubscribe redirects, outcome labels and error statuses
//! - Webhook signature enforcement and guarded overwrites
//! - Store write failures after provider mutations
//! - Direct track endpoint

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use subledger_billing::testing::{Failure, FakeProvider, Operation, DECLINED_TOKEN};
use subledger_billing::{BillingService, SignatureVerifier};
use subledger_shared::{
    Account, AccountLocks, AccountStore, Customer, InMemoryAccountStore, StoreError,
    StoreResult, SubscriptionStatus,
};
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::{
    analytics::{AnalyticsError, AnalyticsSink, RequestContext, Tracker, TrackingEvent},
    auth::JwtManager,
    config::{Config, SubscriptionPolicy},
    routes::create_router,
    state::AppState,
};

const JWT_SECRET: &str = "router-test-secret";
const WEBHOOK_SECRET: &str = "whsec_router_test";

struct ChannelSink {
    tx: mpsc::UnboundedSender<(TrackingEvent, Option<String>)>,
    fail: bool,
}

#[async_trait]
impl AnalyticsSink for ChannelSink {
    async fn track(
        &self,
        event: &TrackingEvent,
        _context: &RequestContext,
        user_email: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        let _ = self
            .tx
            .send((event.clone(), user_email.map(str::to_owned)));
        if self.fail {
            Err(AnalyticsError::Rejected(500))
        } else {
            Ok(())
        }
    }
}

/// In-memory store whose writes can be switched to fail
struct SwitchableStore {
    inner: Arc<InMemoryAccountStore>,
    writes_fail: Arc<AtomicBool>,
}

#[async_trait]
impl AccountStore for SwitchableStore {
    async fn get_by_email(&self, email: &str, create: bool) -> StoreResult<Account> {
        self.inner.get_by_email(email, create).await
    }

    async fn put(&self, account: &Account) -> StoreResult<()> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection refused".to_string()));
        }
        self.inner.put(account).await
    }

    async fn list_with_customer(&self) -> StoreResult<Vec<Account>> {
        self.inner.list_with_customer().await
    }
}

struct Harness {
    app: Router,
    provider: Arc<FakeProvider>,
    /// Backing store, read and seeded directly by tests
    store: Arc<InMemoryAccountStore>,
    writes_fail: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<(TrackingEvent, Option<String>)>,
}

#[derive(Default)]
struct HarnessOptions {
    webhook_secret: Option<&'static str>,
    failing_sink: bool,
    policy: SubscriptionPolicy,
}

fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

fn harness_with(options: HarnessOptions) -> Harness {
    let provider = Arc::new(FakeProvider::new());
    let store = Arc::new(InMemoryAccountStore::new());
    let writes_fail = Arc::new(AtomicBool::new(false));
    let app_store: Arc<dyn AccountStore> = Arc::new(SwitchableStore {
        inner: store.clone(),
        writes_fail: writes_fail.clone(),
    });
    let locks = AccountLocks::new();

    let billing = BillingService::with_provider(provider.clone(), app_store.clone(), locks.clone())
        .plan("monthly")
        .call_timeout(Duration::from_secs(2))
        .webhook_secret(options.webhook_secret.map(str::to_owned))
        .public_key("pk_test_123")
        .build();

    let (tx, events) = mpsc::unbounded_channel();
    let tracker = Tracker::new(Arc::new(ChannelSink {
        tx,
        fail: options.failing_sink,
    }));

    let mut config = Config::for_secret(JWT_SECRET);
    config.subscription_policy = options.policy;

    let state = AppState::new(config, app_store, billing, locks, tracker);

    Harness {
        app: create_router(state),
        provider,
        store,
        writes_fail,
        events,
    }
}

fn bearer(email: &str) -> String {
    let token = JwtManager::new(JWT_SECRET, 1).issue("user-1", email).unwrap();
    format!("Bearer {}", token)
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get_dashboard(&self, email: &str, query: &str) -> Response {
        self.send(
            Request::get(format!("/dashboard/{}", query))
                .header(header::AUTHORIZATION, bearer(email))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn subscribe(&self, email: &str, form: &str) -> Response {
        self.send(
            Request::post("/subscribe/?ref=pricing:%20footer")
                .header(header::AUTHORIZATION, bearer(email))
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn unsubscribe(&self, email: &str) -> Response {
        self.send(
            Request::post("/unsubscribe/")
                .header(header::AUTHORIZATION, bearer(email))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn webhook(&self, payload: &Value, signature: Option<String>) -> Response {
        let mut request = Request::post("/stripe/webhook/");
        if let Some(signature) = signature {
            request = request.header("stripe-signature", signature);
        }
        self.send(request.body(Body::from(payload.to_string())).unwrap())
            .await
    }

    async fn next_event(&mut self) -> (TrackingEvent, Option<String>) {
        tokio::time::timeout(Duration::from_secs(1), self.events.recv())
            .await
            .expect("analytics event dispatched")
            .unwrap()
    }

    async fn stored(&self, email: &str) -> Account {
        self.store.get_by_email(email, false).await.unwrap()
    }

    fn fail_store_writes(&self) {
        self.writes_fail.store(true, Ordering::SeqCst);
    }

    async fn assert_no_event(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await;
        assert!(next.is_err(), "unexpected analytics event: {:?}", next);
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(response: &Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
}

fn event_payload(event_type: &str, object: Value) -> Value {
    json!({
        "id": "evt_1",
        "type": event_type,
        "created": 1_700_000_000,
        "data": { "object": object }
    })
}

// =============================================================================
// Dashboard
// =============================================================================

#[tokio::test]
async fn test_dashboard_requires_auth() {
    let h = harness();
    let response = h
        .send(Request::get("/dashboard/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dashboard_cold_start_creates_and_persists() {
    let mut h = harness();

    let response = h.get_dashboard("a@b.com", "?action=subscribed&tid=t-9").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["email"], "a@b.com");
    assert_eq!(body["stripe_public_key"], "pk_test_123");
    assert_eq!(body["action"], "subscribed");
    assert_eq!(body["ref"], "action: subscribed");
    assert_eq!(body["subscription"]["plan"], "monthly");
    assert_eq!(body["subscription"]["status"], "trialing");
    assert_eq!(body["display_subscription"], true);
    assert!(body["payment_source"].is_null());

    let stored = h.stored("a@b.com").await;
    assert!(stored.subscription().is_some());

    let (event, email) = h.next_event().await;
    assert_eq!(event.name, "Open Dashboard");
    assert_eq!(event.properties["Action"], "subscribed");
    assert_eq!(event.properties["Source"], "action");
    assert_eq!(event.tracking_id.as_deref(), Some("t-9"));
    assert_eq!(email.as_deref(), Some("a@b.com"));
}

#[tokio::test]
async fn test_dashboard_reload_makes_no_provider_calls() {
    let h = harness();
    h.get_dashboard("a@b.com", "").await;
    let calls = h.provider.calls().await.len();

    let response = h.get_dashboard("a@b.com", "?ref=newsletter").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ref"], "newsletter");
    assert!(body["action"].is_null());

    assert_eq!(h.provider.calls().await.len(), calls);
}

#[tokio::test]
async fn test_dashboard_exempt_account_hides_prompt() {
    let h = harness_with(HarnessOptions {
        policy: SubscriptionPolicy::new(Vec::<String>::new(), ["staff.io"]),
        ..HarnessOptions::default()
    });

    let body = body_json(h.get_dashboard("ops@staff.io", "").await).await;
    assert_eq!(body["display_subscription"], false);
}

#[tokio::test]
async fn test_dashboard_checkpoints_customer_when_subscription_fails() {
    let h = harness();
    h.provider
        .fail_next(Operation::CreateSubscription, Failure::Upstream)
        .await;

    let response = h.get_dashboard("a@b.com", "").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let stored = h.stored("a@b.com").await;
    assert!(stored.customer_id().is_some());
    assert!(stored.subscription().is_none());

    let response = h.get_dashboard("a@b.com", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.provider.call_count(Operation::CreateCustomer).await, 1);
    assert_eq!(h.provider.call_count(Operation::CreateSubscription).await, 2);
}

// =============================================================================
// Subscribe / unsubscribe
// =============================================================================

#[tokio::test]
async fn test_subscribe_new_then_update_payment() {
    let mut h = harness();

    let response = h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/dashboard/?action=subscribed");

    let stored = h.stored("a@b.com").await;
    assert_eq!(
        stored.subscription().unwrap().status,
        SubscriptionStatus::Active
    );
    assert_eq!(stored.payment_source().unwrap().last_four, "4242");

    let (event, _) = h.next_event().await;
    assert_eq!(event.name, "Buy Subscription");
    assert_eq!(event.properties["Plan"], "monthly");
    assert_eq!(event.properties["Source"], "pricing");

    let response = h.subscribe("a@b.com", "stripeToken=tok_mastercard").await;
    assert_eq!(location(&response), "/dashboard/?action=payment-updated");
    let (event, _) = h.next_event().await;
    assert_eq!(event.name, "Update Payment Method");
}

#[tokio::test]
async fn test_subscribe_without_token_is_bad_request() {
    let h = harness();
    let response = h.subscribe("a@b.com", "").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.provider.calls().await.is_empty());
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_subscribe_declined_card_is_payment_required() {
    let h = harness();
    let response = h
        .subscribe("a@b.com", &format!("stripeToken={}", DECLINED_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response).await;
    assert_eq!(body["code"], "card_declined");
    assert_eq!(body["decline_code"], "generic_decline");

    // The customer created before the decline is kept for the retry
    let stored = h.stored("a@b.com").await;
    assert!(stored.customer_id().is_some());
}

#[tokio::test]
async fn test_subscribe_upstream_failure_is_bad_gateway() {
    let h = harness();
    h.provider
        .fail_next(Operation::AttachPaymentSource, Failure::Upstream)
        .await;

    let response = h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["code"], "upstream_error");
}

#[tokio::test]
async fn test_unsubscribe_cancels_and_keeps_reference() {
    let mut h = harness();
    h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    h.next_event().await;

    let response = h.unsubscribe("a@b.com").await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/dashboard/?action=unsubscribed");

    let stored = h.stored("a@b.com").await;
    assert_eq!(
        stored.subscription().unwrap().status,
        SubscriptionStatus::Canceled
    );

    let (event, _) = h.next_event().await;
    assert_eq!(event.name, "Cancel Subscription");
}

#[tokio::test]
async fn test_unsubscribe_without_subscription_is_bad_request() {
    let h = harness();
    let response = h.unsubscribe("a@b.com").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.provider.calls().await.is_empty());
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_subscription_deleted_end_to_end() {
    let h = harness();

    let mut account = Account::new("a@b.com");
    let mut local = Customer::new("cus_42", "a@b.com");
    local.set_subscription(subledger_billing::testing::subscription_fixture(
        "sub_1", "cus_42", "monthly",
    ));
    account.customer = Some(local.clone());
    h.store.put(&account).await.unwrap();

    let mut remote = local;
    if let Some(sub) = remote.subscription_mut() {
        sub.status = SubscriptionStatus::Canceled;
    }
    h.provider.insert_customer(remote).await;

    let payload = event_payload(
        "customer.subscription.deleted",
        json!({ "id": "sub_1", "customer": "cus_42", "status": "canceled" }),
    );
    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = h.stored("a@b.com").await;
    assert_eq!(stored.subscription().unwrap().id, "sub_1");
    assert_eq!(
        stored.subscription().unwrap().status,
        SubscriptionStatus::Canceled
    );

    // The dashboard renders the canceled record instead of starting a new trial
    let body = body_json(h.get_dashboard("a@b.com", "").await).await;
    assert_eq!(body["subscription"]["id"], "sub_1");
    assert_eq!(body["subscription"]["status"], "canceled");
    assert_eq!(h.provider.call_count(Operation::CreateSubscription).await, 0);
}

#[tokio::test]
async fn test_resubscribe_after_cancel_starts_new_subscription() {
    let mut h = harness();
    h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    h.next_event().await;
    h.unsubscribe("a@b.com").await;
    h.next_event().await;
    let canceled_id = h.stored("a@b.com").await.subscription().unwrap().id.clone();

    let response = h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    assert_eq!(location(&response), "/dashboard/?action=subscribed");

    let stored = h.stored("a@b.com").await;
    let tracked = stored.subscription().unwrap();
    assert_ne!(tracked.id, canceled_id);
    assert_eq!(tracked.status, SubscriptionStatus::Active);
    assert_eq!(h.provider.call_count(Operation::CreateSubscription).await, 2);

    let (event, _) = h.next_event().await;
    assert_eq!(event.name, "Buy Subscription");
}

#[tokio::test]
async fn test_webhook_guard_ignores_foreign_customer() {
    let h = harness();
    let mut account = Account::new("a@b.com");
    account.customer = Some(Customer::new("cus_1", "a@b.com"));
    h.store.put(&account).await.unwrap();

    let payload = event_payload(
        "customer.updated",
        json!({ "id": "cus_2", "email": "a@b.com", "delinquent": true }),
    );
    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.stored("a@b.com").await.customer_id(), Some("cus_1"));
}

#[tokio::test]
async fn test_webhook_unrecognized_type_is_ok() {
    let h = harness();
    let payload = event_payload("invoice.paid", json!({ "id": "in_1" }));
    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_webhook_malformed_bodies() {
    let h = harness();

    let response = h
        .send(
            Request::post("/stripe/webhook/")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Recognized type with an undecodable object asks the provider to redeliver
    let payload = event_payload("customer.updated", json!({ "email": "a@b.com" }));
    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_webhook_signature_enforced_when_configured() {
    let h = harness_with(HarnessOptions {
        webhook_secret: Some(WEBHOOK_SECRET),
        ..HarnessOptions::default()
    });
    let payload = event_payload(
        "customer.created",
        json!({ "id": "cus_7", "email": "new@b.com" }),
    );

    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let forged = SignatureVerifier::new("whsec_other")
        .sign(&payload.to_string(), time::OffsetDateTime::now_utc().unix_timestamp())
        .unwrap();
    let response = h.webhook(&payload, Some(forged)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.store.is_empty().await);

    let signature = SignatureVerifier::new(WEBHOOK_SECRET)
        .sign(&payload.to_string(), time::OffsetDateTime::now_utc().unix_timestamp())
        .unwrap();
    let response = h.webhook(&payload, Some(signature)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.stored("new@b.com").await.customer_id(), Some("cus_7"));
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn test_webhook_store_failure_is_server_error() {
    let h = harness();
    let mut account = Account::new("a@b.com");
    account.customer = Some(Customer::new("cus_1", "a@b.com"));
    h.store.put(&account).await.unwrap();
    h.fail_store_writes();

    let payload = event_payload(
        "customer.updated",
        json!({ "id": "cus_1", "email": "a@b.com", "delinquent": true }),
    );
    let response = h.webhook(&payload, None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["code"], "database_error");

    let stored = h.stored("a@b.com").await;
    assert_eq!(stored.customer.unwrap().delinquent, None);
}

#[tokio::test]
async fn test_subscribe_store_failure_is_reported_without_redirect() {
    let mut h = harness();
    h.fail_store_writes();

    let response = h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(header::LOCATION).is_none());
    assert_eq!(h.provider.call_count(Operation::UpdateSubscription).await, 1);

    h.assert_no_event().await;
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_unsubscribe_store_failure_is_reported_without_redirect() {
    let mut h = harness();
    h.subscribe("a@b.com", "stripeToken=tok_visa").await;
    h.next_event().await;
    h.fail_store_writes();

    let response = h.unsubscribe("a@b.com").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(header::LOCATION).is_none());
    assert_eq!(h.provider.call_count(Operation::CancelSubscription).await, 1);

    h.assert_no_event().await;
    assert_eq!(
        h.stored("a@b.com").await.subscription().unwrap().status,
        SubscriptionStatus::Active
    );
}

// =============================================================================
// Track / health
// =============================================================================

#[tokio::test]
async fn test_track_echoes_event() {
    let mut h = harness();
    let event = json!({ "event": "Visit Pricing", "properties": { "Plan": "monthly" } });

    let response = h
        .send(
            Request::post("/track/")
                .header(header::AUTHORIZATION, bearer("a@b.com"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(event.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, event);

    let (tracked, email) = h.next_event().await;
    assert_eq!(tracked.name, "Visit Pricing");
    assert_eq!(email.as_deref(), Some("a@b.com"));
}

#[tokio::test]
async fn test_track_anonymous_and_sink_failure() {
    let h = harness_with(HarnessOptions {
        failing_sink: true,
        ..HarnessOptions::default()
    });

    let response = h
        .send(
            Request::post("/track/")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"event":"Visit"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_handlers() {
    let h = harness_with(HarnessOptions {
        failing_sink: true,
        ..HarnessOptions::default()
    });
    let response = h.get_dashboard("a@b.com", "").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let response = h
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}
