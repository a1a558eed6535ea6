//! Stripe client and configuration

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stripe::{
    CancelSubscription, CreateCustomer, CreateSubscription, CreateSubscriptionItems, CustomerId,
    PaymentSourceParams, Scheduled, SubscriptionId, TokenId, UpdateCustomer, UpdateSubscription,
};
use subledger_shared::{Customer, Subscription};

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, SubscriptionUpdate};

/// Plan used when an account needs a subscription and none was chosen
pub const DEFAULT_PLAN: &str = "monthly";

/// Default per-call provider timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Customer lists are not included by default and must be expanded
const EXPAND_CUSTOMER: &[&str] = &["sources", "subscriptions"];

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Publishable key, handed to the browser for tokenizing cards
    pub public_key: String,
    /// Signing secret for webhook verification; verification is skipped when unset
    pub webhook_secret: Option<String>,
    pub default_plan: String,
    pub request_timeout: Duration,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let request_timeout = match std::env::var("STRIPE_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                BillingError::Config(format!("Invalid STRIPE_REQUEST_TIMEOUT_SECS: {}", raw))
            })?,
            Err(_) => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            secret_key,
            public_key: std::env::var("STRIPE_PUBLIC_KEY").unwrap_or_default(),
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            default_plan: std::env::var("STRIPE_DEFAULT_PLAN")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_PLAN.to_string()),
            request_timeout,
        })
    }
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    /// Create a client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
}

/// Re-shape an SDK object into the local mirror type through its JSON form
fn mirror<S, T>(value: &S) -> BillingResult<T>
where
    S: Serialize,
    T: DeserializeOwned,
{
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| BillingError::stripe_api(format!("Unexpected Stripe response shape: {}", e), None))
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(&self, email: &str) -> BillingResult<Customer> {
        let mut params = CreateCustomer::new();
        params.email = Some(email);

        let customer = stripe::Customer::create(&self.inner, params).await?;

        tracing::info!(
            customer_id = %customer.id,
            email = %email,
            "Created Stripe customer"
        );

        mirror(&customer)
    }

    async fn attach_payment_source(
        &self,
        customer_id: &str,
        token: &str,
    ) -> BillingResult<Customer> {
        let customer_id = parse_customer_id(customer_id)?;
        let token = token
            .parse::<TokenId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment token: {}", e)))?;

        let mut params = UpdateCustomer::new();
        params.source = Some(PaymentSourceParams::Token(token));
        params.expand = EXPAND_CUSTOMER;

        let customer = stripe::Customer::update(&self.inner, &customer_id, params).await?;

        tracing::info!(customer_id = %customer.id, "Updated customer payment source");

        mirror(&customer)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        plan: &str,
    ) -> BillingResult<Subscription> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(plan.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let subscription = stripe::Subscription::create(&self.inner, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            plan = %plan,
            "Created subscription"
        );

        mirror(&subscription)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Subscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let params = UpdateSubscription {
            trial_end: update.end_trial_now.then(Scheduled::now),
            ..Default::default()
        };

        let subscription = stripe::Subscription::update(&self.inner, &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            end_trial_now = update.end_trial_now,
            "Updated subscription"
        );

        mirror(&subscription)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = stripe::Subscription::cancel(&self.inner, &sub_id, params).await?;

        tracing::info!(subscription_id = %subscription.id, "Cancelled subscription");

        mirror(&subscription)
    }

    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Customer> {
        let customer_id = parse_customer_id(customer_id)?;
        let customer =
            stripe::Customer::retrieve(&self.inner, &customer_id, EXPAND_CUSTOMER).await?;
        mirror(&customer)
    }
}
