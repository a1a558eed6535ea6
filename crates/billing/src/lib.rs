// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries owned provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger Billing Module
//!
//! Keeps local accounts reconciled with Stripe customers and subscriptions.
//!
//! ## Features
//!
//! - **Reconciliation**: Ensure-subscription, subscribe, unsubscribe and the
//!   dashboard read path
//! - **Webhooks**: Signature verification and guarded customer overwrites
//! - **Error Classification**: Card errors kept apart from upstream faults
//! - **Invariants**: Consistency checks over stored accounts

pub mod client;
pub mod error;
pub mod invariants;
pub mod provider;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


use std::sync::Arc;
use std::time::Duration;

use subledger_shared::{AccountLocks, AccountStore};

// Client
pub use client::{StripeClient, StripeConfig, DEFAULT_PLAN, DEFAULT_REQUEST_TIMEOUT};

// Error
pub use error::{BillingError, BillingResult};

// Provider
pub use provider::{BillingProvider, SubscriptionUpdate};

// Subscriptions
pub use subscriptions::{DashboardSnapshot, SubscribeOutcome, SubscriptionService, SubscriptionView};

// Webhooks
pub use webhooks::{
    apply_customer_delta, IgnoreReason, ProviderEvent, SignatureVerifier, WebhookEvent,
    WebhookHandler, WebhookOutcome,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    /// Publishable key handed to the dashboard
    pub public_key: String,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(store: Arc<dyn AccountStore>, locks: AccountLocks) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, store, locks))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, store: Arc<dyn AccountStore>, locks: AccountLocks) -> Self {
        let public_key = config.public_key.clone();
        let default_plan = config.default_plan.clone();
        let webhook_secret = config.webhook_secret.clone();
        let timeout = config.request_timeout;
        let stripe = Arc::new(StripeClient::new(config));

        Self::with_provider(stripe, store, locks)
            .plan(default_plan)
            .call_timeout(timeout)
            .webhook_secret(webhook_secret)
            .public_key(public_key)
            .build()
    }

    /// Start from any provider implementation, with default plan and timeout
    pub fn with_provider(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn AccountStore>,
        locks: AccountLocks,
    ) -> BillingServiceBuilder {
        BillingServiceBuilder {
            provider,
            store,
            locks,
            default_plan: DEFAULT_PLAN.to_string(),
            call_timeout: DEFAULT_REQUEST_TIMEOUT,
            webhook_secret: None,
            public_key: String::new(),
        }
    }
}

pub struct BillingServiceBuilder {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn AccountStore>,
    locks: AccountLocks,
    default_plan: String,
    call_timeout: Duration,
    webhook_secret: Option<String>,
    public_key: String,
}

impl BillingServiceBuilder {
    pub fn plan(mut self, default_plan: impl Into<String>) -> Self {
        self.default_plan = default_plan.into();
        self
    }

    /// Per-call provider timeout
    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Enables signature verification when `Some`
    pub fn webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = key.into();
        self
    }

    pub fn build(self) -> BillingService {
        BillingService {
            subscriptions: SubscriptionService::new(
                self.provider.clone(),
                self.default_plan,
                self.call_timeout,
            ),
            webhooks: WebhookHandler::new(
                self.provider,
                self.store,
                self.locks,
                self.webhook_secret,
                self.call_timeout,
            ),
            public_key: self.public_key,
        }
    }
}
