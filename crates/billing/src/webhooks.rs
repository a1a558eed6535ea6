//! Stripe webhook handling
//!
//! Turns provider events into guarded overwrites of the matching account's
//! customer. Customer events carry the customer; subscription events only
//! reference it, so the full customer is fetched first and the event's
//! subscription is merged in when the fetched list leaves it out.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subledger_shared::{Account, AccountLocks, AccountStore, Customer, Subscription};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::provider::{with_timeout, BillingProvider};
use crate::subscriptions::replace_customer;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook
pub const SIGNATURE_TOLERANCE: Duration = Duration::from_secs(300);

/// Attempts after the first for the customer fetch on subscription events
const FETCH_RETRIES: usize = 3;

/// Event envelope as posted by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::InvalidPayload(e.to_string()))
    }
}

/// Webhook event families this service reacts to, resolved once per delivery
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// `customer.created` / `customer.updated`
    CustomerUpserted(Customer),
    /// `customer.subscription.created|updated|deleted`
    SubscriptionChanged {
        customer_id: String,
        subscription: Subscription,
    },
    Unrecognized(String),
}

impl WebhookEvent {
    pub fn from_event(event: &ProviderEvent) -> BillingResult<Self> {
        let payload_error = |e: serde_json::Error| BillingError::WebhookPayload {
            event_type: event.event_type.clone(),
            reason: e.to_string(),
        };

        match event.event_type.as_str() {
            "customer.created" | "customer.updated" => {
                let customer: Customer =
                    serde_json::from_value(event.data.object.clone()).map_err(payload_error)?;
                Ok(WebhookEvent::CustomerUpserted(customer))
            }
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let subscription: Subscription =
                    serde_json::from_value(event.data.object.clone()).map_err(payload_error)?;
                let customer_id =
                    subscription
                        .customer
                        .clone()
                        .ok_or_else(|| BillingError::WebhookPayload {
                            event_type: event.event_type.clone(),
                            reason: "subscription does not reference a customer".to_string(),
                        })?;
                Ok(WebhookEvent::SubscriptionChanged {
                    customer_id,
                    subscription,
                })
            }
            other => Ok(WebhookEvent::Unrecognized(other.to_string())),
        }
    }
}

/// Why a recognized event left the account untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The account already tracks a different customer
    CustomerIdMismatch { local: String, incoming: String },
    /// The customer has no email to resolve an account by
    MissingEmail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Ignored(IgnoreReason),
    Unrecognized,
}

impl WebhookOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WebhookOutcome::Applied)
    }
}

/// Overwrite the account's customer with `incoming` unless the account is
/// already bound to a different customer ID.
pub fn apply_customer_delta(account: &mut Account, incoming: Customer) -> WebhookOutcome {
    if let Some(local) = account.customer_id() {
        if local != incoming.id {
            return WebhookOutcome::Ignored(IgnoreReason::CustomerIdMismatch {
                local: local.to_string(),
                incoming: incoming.id,
            });
        }
    }

    replace_customer(account, incoming);
    WebhookOutcome::Applied
}

/// `Stripe-Signature` verification (`t=<unix>,v1=<hex hmac>`)
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: SIGNATURE_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn mac(&self, timestamp: i64, payload: &str) -> BillingResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    pub fn verify(&self, payload: &str, header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if signatures.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let age = now.abs_diff(timestamp);
        if age > self.tolerance.as_secs() {
            tracing::warn!(timestamp = timestamp, now = now, age = age, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mac = self.mac(timestamp, payload)?;
        let matched = signatures
            .iter()
            .filter_map(|sig| hex::decode(sig).ok())
            .any(|sig| mac.clone().verify_slice(&sig).is_ok());

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Produce a header value the way the provider does
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let signature = hex::encode(self.mac(timestamp, payload)?.finalize().into_bytes());
        Ok(format!("t={},v1={}", timestamp, signature))
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn AccountStore>,
    locks: AccountLocks,
    verifier: Option<SignatureVerifier>,
    call_timeout: Duration,
}

impl WebhookHandler {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn AccountStore>,
        locks: AccountLocks,
        webhook_secret: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
        }

        Self {
            provider,
            store,
            locks,
            verifier: webhook_secret.map(SignatureVerifier::new),
            call_timeout,
        }
    }

    pub fn verifies_signatures(&self) -> bool {
        self.verifier.is_some()
    }

    /// Verify the signature (when a secret is configured) and parse the envelope
    pub fn verify_event(&self, payload: &str, signature: Option<&str>) -> BillingResult<ProviderEvent> {
        if let Some(verifier) = &self.verifier {
            let signature = signature.ok_or_else(|| {
                tracing::warn!("Webhook delivered without Stripe-Signature header");
                BillingError::WebhookSignatureInvalid
            })?;
            verifier.verify(payload, signature)?;
        }

        ProviderEvent::parse(payload)
    }

    /// Apply one delivered event
    pub async fn handle_event(&self, event: ProviderEvent) -> BillingResult<WebhookOutcome> {
        let outcome = match WebhookEvent::from_event(&event)? {
            WebhookEvent::CustomerUpserted(customer) => self.apply_customer(customer).await?,
            WebhookEvent::SubscriptionChanged {
                customer_id,
                subscription,
            } => {
                tracing::debug!(
                    customer_id = %customer_id,
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Fetching customer for subscription event"
                );
                let mut customer = self.fetch_customer(&customer_id).await?;
                customer.merge_subscription(subscription);
                self.apply_customer(customer).await?
            }
            WebhookEvent::Unrecognized(event_type) => {
                tracing::debug!(event_id = %event.id, event_type = %event_type, "Ignoring unhandled webhook event type");
                WebhookOutcome::Unrecognized
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "stripe_hook"
        );

        Ok(outcome)
    }

    /// Re-fetch a customer from the provider and apply it to its account
    pub async fn sync_customer(&self, customer_id: &str) -> BillingResult<WebhookOutcome> {
        let customer = self.fetch_customer(customer_id).await?;
        self.apply_customer(customer).await
    }

    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Customer> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(25)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(FETCH_RETRIES);

        RetryIf::spawn(
            strategy,
            || {
                with_timeout(
                    self.call_timeout,
                    "fetch_customer",
                    self.provider.fetch_customer(customer_id),
                )
            },
            |e: &BillingError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(customer_id = %customer_id, error = %e, "Retrying customer fetch");
                }
                retry
            },
        )
        .await
    }

    async fn apply_customer(&self, customer: Customer) -> BillingResult<WebhookOutcome> {
        let Some(email) = customer.email.clone().filter(|e| !e.is_empty()) else {
            tracing::warn!(customer_id = %customer.id, "Customer has no email, ignoring");
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingEmail));
        };

        let _guard = self.locks.lock(&email).await;
        let mut account = self.store.get_by_email(&email, true).await?;

        let outcome = apply_customer_delta(&mut account, customer);
        match &outcome {
            WebhookOutcome::Applied => {
                self.store.put(&account).await?;
                tracing::info!(
                    email = %email,
                    customer_id = ?account.customer_id(),
                    status = ?account.subscription().map(|s| s.status),
                    "Applied customer from provider"
                );
            }
            WebhookOutcome::Ignored(IgnoreReason::CustomerIdMismatch { local, incoming }) => {
                tracing::warn!(
                    email = %email,
                    local_customer_id = %local,
                    incoming_customer_id = %incoming,
                    "Customer ID mismatch, leaving account untouched"
                );
            }
            _ => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use subledger_shared::SubscriptionStatus;

    fn event(event_type: &str, object: serde_json::Value) -> ProviderEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_customer_events_decode_customer() {
        for kind in ["customer.created", "customer.updated"] {
            let parsed =
                WebhookEvent::from_event(&event(kind, json!({ "id": "cus_1", "email": "a@b.com" })))
                    .unwrap();
            match parsed {
                WebhookEvent::CustomerUpserted(c) => assert_eq!(c.id, "cus_1"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_subscription_events_reference_customer() {
        let parsed = WebhookEvent::from_event(&event(
            "customer.subscription.deleted",
            json!({ "id": "sub_1", "customer": "cus_42", "status": "canceled" }),
        ))
        .unwrap();
        match parsed {
            WebhookEvent::SubscriptionChanged {
                customer_id,
                subscription,
            } => {
                assert_eq!(customer_id, "cus_42");
                assert_eq!(subscription.id, "sub_1");
                assert_eq!(subscription.status, SubscriptionStatus::Canceled);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        let parsed = WebhookEvent::from_event(&event("invoice.paid", json!({ "id": "in_1" }))).unwrap();
        assert_eq!(parsed, WebhookEvent::Unrecognized("invoice.paid".into()));
    }

    #[test]
    fn test_broken_payload_on_recognized_type() {
        let err = WebhookEvent::from_event(&event("customer.updated", json!({ "email": 5 })))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayload { .. }));

        let err = WebhookEvent::from_event(&event(
            "customer.subscription.updated",
            json!({ "id": "sub_1", "status": "active" }),
        ))
        .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayload { .. }));
    }

    #[test]
    fn test_envelope_parse_failure() {
        assert!(matches!(
            ProviderEvent::parse("not json"),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_delta_guard() {
        let mut account = Account::new("a@b.com");
        account.customer = Some(Customer::new("cus_1", "a@b.com"));

        let outcome = apply_customer_delta(&mut account, Customer::new("cus_2", "a@b.com"));
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored(IgnoreReason::CustomerIdMismatch {
                local: "cus_1".into(),
                incoming: "cus_2".into()
            })
        );
        assert_eq!(account.customer_id(), Some("cus_1"));

        let mut incoming = Customer::new("cus_1", "a@b.com");
        incoming.set_subscription(
            serde_json::from_value(json!({ "id": "sub_1", "customer": "cus_1", "status": "active" }))
                .unwrap(),
        );
        assert!(apply_customer_delta(&mut account, incoming).is_applied());
        assert_eq!(
            account.subscription().unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn test_delta_binds_unlinked_account() {
        let mut account = Account::new("a@b.com");
        assert!(apply_customer_delta(&mut account, Customer::new("cus_9", "a@b.com")).is_applied());
        assert_eq!(account.customer_id(), Some("cus_9"));
    }

    #[test]
    fn test_signature_round_trip() {
        let verifier = SignatureVerifier::new("whsec_test");
        let payload = r#"{"id":"evt_1"}"#;
        let header = verifier.sign(payload, 1_700_000_000).unwrap();

        assert!(verifier.verify_at(payload, &header, 1_700_000_100).is_ok());
        assert!(matches!(
            verifier.verify_at("{}", &header, 1_700_000_100),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_signature_rejects_stale_and_malformed_headers() {
        let verifier = SignatureVerifier::new("whsec_test");
        let payload = "{}";
        let header = verifier.sign(payload, 1_700_000_000).unwrap();

        assert!(verifier.verify_at(payload, &header, 1_700_000_301).is_err());
        assert!(verifier.verify_at(payload, "v1=abcd", 1_700_000_000).is_err());
        assert!(verifier.verify_at(payload, "t=1700000000", 1_700_000_000).is_err());
        assert!(verifier
            .verify_at(payload, "t=1700000000,v1=zz", 1_700_000_000)
            .is_err());
    }

    #[test]
    fn test_signature_accepts_any_matching_v1() {
        let verifier = SignatureVerifier::new("whsec_test");
        let payload = "{}";
        let header = verifier.sign(payload, 1_700_000_000).unwrap();
        let rotated = format!("{},v1={}", header, "00".repeat(32));
        assert!(verifier.verify_at(payload, &rotated, 1_700_000_000).is_ok());
    }
}
