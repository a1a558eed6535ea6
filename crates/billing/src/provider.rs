//! Billing provider seam
//!
//! The reconciliation core only talks to the provider through this trait.
//! `StripeClient` implements it against the Stripe API; tests use the
//! scripted `testing::FakeProvider`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use subledger_shared::{Customer, Subscription};

use crate::error::{BillingError, BillingResult};

/// Fields to change on an existing subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// End any trial immediately and start billing
    pub end_trial_now: bool,
}

impl SubscriptionUpdate {
    pub fn end_trial_now() -> Self {
        Self {
            end_trial_now: true,
        }
    }
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_customer(&self, email: &str) -> BillingResult<Customer>;

    /// Set the customer's default payment source from a client-side token.
    /// Returns the customer with sources and subscriptions expanded.
    async fn attach_payment_source(&self, customer_id: &str, token: &str)
        -> BillingResult<Customer>;

    async fn create_subscription(&self, customer_id: &str, plan: &str)
        -> BillingResult<Subscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Subscription>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    /// Fetch the customer with sources and subscriptions expanded
    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Customer>;
}

/// Bound a provider call by `limit`; expiry surfaces as `BillingError::Timeout`
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = operation,
                timeout_ms = limit.as_millis() as u64,
                "Provider call timed out"
            );
            Err(BillingError::Timeout(operation))
        }
    }
}
