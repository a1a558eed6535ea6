//! Scripted in-memory provider
//!
//! Records every call and lets tests queue failures for specific operations.
//! Customers come back the way Stripe returns them: the expanded
//! subscription list leaves out canceled subscriptions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use subledger_shared::{
    Customer, PaymentSource, PlanRef, ProviderList, Subscription, SubscriptionStatus,
};
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, SubscriptionUpdate};

/// Token that the fake treats as a declined card
pub const DECLINED_TOKEN: &str = "tok_chargeDeclined";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCustomer,
    AttachPaymentSource,
    CreateSubscription,
    UpdateSubscription,
    CancelSubscription,
    FetchCustomer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateCustomer { email: String },
    AttachPaymentSource { customer_id: String, token: String },
    CreateSubscription { customer_id: String, plan: String },
    UpdateSubscription { subscription_id: String, end_trial_now: bool },
    CancelSubscription { subscription_id: String },
    FetchCustomer { customer_id: String },
}

impl ProviderCall {
    pub fn operation(&self) -> Operation {
        match self {
            ProviderCall::CreateCustomer { .. } => Operation::CreateCustomer,
            ProviderCall::AttachPaymentSource { .. } => Operation::AttachPaymentSource,
            ProviderCall::CreateSubscription { .. } => Operation::CreateSubscription,
            ProviderCall::UpdateSubscription { .. } => Operation::UpdateSubscription,
            ProviderCall::CancelSubscription { .. } => Operation::CancelSubscription,
            ProviderCall::FetchCustomer { .. } => Operation::FetchCustomer,
        }
    }
}

/// Failure to inject on the next call of an operation
#[derive(Debug, Clone)]
pub enum Failure {
    CardDeclined,
    Upstream,
}

impl Failure {
    fn into_error(self) -> BillingError {
        match self {
            Failure::CardDeclined => BillingError::Card {
                message: "Your card was declined.".to_string(),
                decline_code: Some("generic_decline".to_string()),
            },
            Failure::Upstream => BillingError::stripe_api("simulated upstream failure", Some(503)),
        }
    }
}

#[derive(Default)]
struct FakeState {
    customers: HashMap<String, Customer>,
    calls: Vec<ProviderCall>,
    failures: HashMap<Operation, Vec<Failure>>,
    latency: Option<Duration>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    fn record(&mut self, call: ProviderCall) -> BillingResult<()> {
        let op = call.operation();
        self.calls.push(call);
        match self.failures.get_mut(&op) {
            Some(queue) if !queue.is_empty() => Err(queue.remove(0).into_error()),
            _ => Ok(()),
        }
    }

    fn subscription_mut(&mut self, subscription_id: &str) -> BillingResult<&mut Subscription> {
        self.customers
            .values_mut()
            .filter_map(|c| c.subscriptions.as_mut())
            .flat_map(|list| list.data.iter_mut())
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| {
                BillingError::stripe_api(format!("No such subscription: {}", subscription_id), Some(404))
            })
    }
}

/// In-memory `BillingProvider` for tests
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a customer the provider already knows about
    pub async fn insert_customer(&self, customer: Customer) {
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id.clone(), customer);
    }

    pub async fn customer(&self, customer_id: &str) -> Option<Customer> {
        self.state.lock().await.customers.get(customer_id).cloned()
    }

    /// Fail the next call of `op` (queued failures are consumed in order)
    pub async fn fail_next(&self, op: Operation, failure: Failure) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push(failure);
    }

    /// Delay every call by `latency`
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = Some(latency);
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, op: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .count()
    }

    async fn delay(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Copy of `customer` as the provider lists it, without canceled subscriptions
fn as_listed(customer: &Customer) -> Customer {
    let mut listed = customer.clone();
    if let Some(list) = listed.subscriptions.as_mut() {
        list.data.retain(|s| !s.is_canceled());
    }
    listed
}

/// Build a subscription the way the provider reports a fresh one
pub fn subscription_fixture(id: &str, customer_id: &str, plan: &str) -> Subscription {
    Subscription {
        id: id.to_string(),
        customer: Some(customer_id.to_string()),
        plan: Some(PlanRef {
            id: plan.to_string(),
            nickname: None,
        }),
        items: None,
        status: SubscriptionStatus::Trialing,
        trial_end: Some(1_900_000_000),
        current_period_end: Some(1_900_000_000),
        cancel_at_period_end: false,
        canceled_at: None,
        created: Some(1_700_000_000),
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn create_customer(&self, email: &str) -> BillingResult<Customer> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::CreateCustomer {
            email: email.to_string(),
        })?;

        let id = state.next_id("cus");
        let customer = Customer::new(id.clone(), email);
        state.customers.insert(id, customer.clone());
        Ok(customer)
    }

    async fn attach_payment_source(
        &self,
        customer_id: &str,
        token: &str,
    ) -> BillingResult<Customer> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::AttachPaymentSource {
            customer_id: customer_id.to_string(),
            token: token.to_string(),
        })?;

        if token == DECLINED_TOKEN {
            return Err(Failure::CardDeclined.into_error());
        }

        let card_id = state.next_id("card");
        let customer = state.customers.get_mut(customer_id).ok_or_else(|| {
            BillingError::stripe_api(format!("No such customer: {}", customer_id), Some(404))
        })?;
        customer.sources = Some(ProviderList::from_vec(vec![PaymentSource {
            id: card_id,
            object: Some("card".to_string()),
            brand: Some("Visa".to_string()),
            last4: Some("4242".to_string()),
            exp_month: Some(12),
            exp_year: Some(2030),
            card: None,
        }]));
        Ok(as_listed(customer))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        plan: &str,
    ) -> BillingResult<Subscription> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::CreateSubscription {
            customer_id: customer_id.to_string(),
            plan: plan.to_string(),
        })?;

        let id = state.next_id("sub");
        let subscription = subscription_fixture(&id, customer_id, plan);
        let customer = state.customers.get_mut(customer_id).ok_or_else(|| {
            BillingError::stripe_api(format!("No such customer: {}", customer_id), Some(404))
        })?;
        customer.set_subscription(subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Subscription> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::UpdateSubscription {
            subscription_id: subscription_id.to_string(),
            end_trial_now: update.end_trial_now,
        })?;

        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.is_canceled() {
            return Err(BillingError::stripe_api(
                "A canceled subscription can only update its cancellation_details and metadata",
                Some(400),
            ));
        }
        if update.end_trial_now {
            subscription.trial_end = Some(1_700_000_000);
            subscription.status = SubscriptionStatus::Active;
        }
        Ok(subscription.clone())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::CancelSubscription {
            subscription_id: subscription_id.to_string(),
        })?;

        let subscription = state.subscription_mut(subscription_id)?;
        if subscription.is_canceled() {
            return Err(BillingError::stripe_api(
                format!("No such subscription: '{}'", subscription_id),
                Some(404),
            ));
        }
        subscription.status = SubscriptionStatus::Canceled;
        subscription.canceled_at = Some(1_700_000_000);
        Ok(subscription.clone())
    }

    async fn fetch_customer(&self, customer_id: &str) -> BillingResult<Customer> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.record(ProviderCall::FetchCustomer {
            customer_id: customer_id.to_string(),
        })?;

        state.customers.get(customer_id).map(as_listed).ok_or_else(|| {
            BillingError::stripe_api(format!("No such customer: {}", customer_id), Some(404))
        })
    }
}
