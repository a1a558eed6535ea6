//! Subscription reconciliation
//!
//! Keeps an `Account`'s customer/subscription references consistent with the
//! provider. Every operation mutates the account in memory only; the caller
//! persists it once the operation succeeds.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use subledger_shared::{Account, CardSummary, Customer, Subscription, SubscriptionStatus};
use time::format_description::well_known::Rfc3339;

use crate::error::{BillingError, BillingResult};
use crate::provider::{with_timeout, BillingProvider, SubscriptionUpdate};

/// What a successful subscribe call did, fixed by the state before mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    NewSubscription,
    PaymentMethodUpdated,
}

impl SubscribeOutcome {
    /// Tag appended to the dashboard redirect
    pub fn action(&self) -> &'static str {
        match self {
            SubscribeOutcome::NewSubscription => "subscribed",
            SubscribeOutcome::PaymentMethodUpdated => "payment-updated",
        }
    }

    /// Analytics event name
    pub fn event_name(&self) -> &'static str {
        match self {
            SubscribeOutcome::NewSubscription => "Buy Subscription",
            SubscribeOutcome::PaymentMethodUpdated => "Update Payment Method",
        }
    }
}

/// Subscription fields the dashboard renders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionView {
    pub id: String,
    pub plan: Option<String>,
    pub status: String,
    /// RFC 3339
    pub trial_end: Option<String>,
    pub cancel_at_period_end: bool,
}

impl From<&Subscription> for SubscriptionView {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.clone(),
            plan: sub.plan_id().map(str::to_owned),
            status: sub.status.to_string(),
            trial_end: sub.trial_end_at().and_then(|t| t.format(&Rfc3339).ok()),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

/// Presentation-ready account billing snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub email: String,
    pub tracking_id: String,
    pub subscription: SubscriptionView,
    pub payment_source: Option<CardSummary>,
    /// Whether the subscription prompt should be shown at all
    pub display_subscription: bool,
}

/// Replace the account's customer with the provider's copy.
///
/// Lists the incoming payload does not carry are kept from the local copy so
/// that a partial payload cannot drop a subscription we still track. Stripe
/// leaves canceled subscriptions out of the customer's list, so a tracked
/// subscription the list omits is kept as canceled.
pub(crate) fn replace_customer(account: &mut Account, mut incoming: Customer) {
    if let Some(local) = account.customer.take() {
        let tracked = local.subscription().cloned();
        if incoming.subscriptions.is_none() {
            incoming.subscriptions = local.subscriptions;
        } else if let Some(mut tracked) = tracked {
            tracked.status = SubscriptionStatus::Canceled;
            incoming.merge_subscription(tracked);
        }
        if incoming.sources.is_none() {
            incoming.sources = local.sources;
        }
    }
    account.customer = Some(incoming);
}

/// Subscription service driving the provider on behalf of one account at a time
#[derive(Clone)]
pub struct SubscriptionService {
    provider: Arc<dyn BillingProvider>,
    default_plan: String,
    call_timeout: Duration,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        default_plan: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            default_plan: default_plan.into(),
            call_timeout,
        }
    }

    pub fn default_plan(&self) -> &str {
        &self.default_plan
    }

    /// Make sure the account has a customer on the provider, creating one if needed
    pub async fn ensure_customer<'a>(
        &self,
        account: &'a mut Account,
    ) -> BillingResult<&'a mut Customer> {
        let customer = match account.customer.take() {
            Some(customer) => customer,
            None => {
                let customer = with_timeout(
                    self.call_timeout,
                    "create_customer",
                    self.provider.create_customer(&account.email),
                )
                .await?;

                tracing::info!(
                    email = %account.email,
                    customer_id = %customer.id,
                    "Created customer for account"
                );
                customer
            }
        };

        Ok(account.customer.insert(customer))
    }

    /// Guarantee the account has a subscription, creating the customer and/or
    /// subscription on the provider when missing.
    ///
    /// With a subscription already present this makes no provider calls. On
    /// failure, a customer created along the way stays on the account so a
    /// retry resumes at subscription creation.
    pub async fn ensure_subscription<'a>(
        &self,
        account: &'a mut Account,
    ) -> BillingResult<&'a Subscription> {
        if self.ensure_customer(account).await?.subscription().is_none() {
            self.create_subscription(account).await?;
        }

        account.subscription().ok_or_else(|| {
            BillingError::stripe_api("Provider returned no subscription for customer", None)
        })
    }

    /// Start a subscription on the default plan and make it the tracked one
    async fn create_subscription(&self, account: &mut Account) -> BillingResult<()> {
        let email = account.email.clone();
        let customer = self.ensure_customer(account).await?;

        let subscription = with_timeout(
            self.call_timeout,
            "create_subscription",
            self.provider
                .create_subscription(&customer.id, &self.default_plan),
        )
        .await?;

        tracing::info!(
            email = %email,
            customer_id = %customer.id,
            subscription_id = %subscription.id,
            plan = %self.default_plan,
            "Created subscription for account"
        );
        customer.set_subscription(subscription);
        Ok(())
    }

    /// Attach a payment source, make sure a subscription exists and end its trial
    pub async fn subscribe(
        &self,
        account: &mut Account,
        token: &str,
    ) -> BillingResult<SubscribeOutcome> {
        let token = token.trim();
        if token.is_empty() {
            return Err(BillingError::MissingPaymentToken);
        }

        let outcome = if account.has_active_subscription() {
            SubscribeOutcome::PaymentMethodUpdated
        } else {
            SubscribeOutcome::NewSubscription
        };

        let customer_id = self.ensure_customer(account).await?.id.clone();

        let customer = with_timeout(
            self.call_timeout,
            "attach_payment_source",
            self.provider.attach_payment_source(&customer_id, token),
        )
        .await
        .inspect_err(|e| {
            if e.is_card_error() {
                tracing::warn!(email = %account.email, error = %e, "Card rejected");
            }
        })?;
        replace_customer(account, customer);

        if account.subscription().is_some_and(Subscription::is_canceled) {
            self.create_subscription(account).await?;
        }
        let subscription_id = self.ensure_subscription(account).await?.id.clone();

        let subscription = with_timeout(
            self.call_timeout,
            "update_subscription",
            self.provider
                .update_subscription(&subscription_id, &SubscriptionUpdate::end_trial_now()),
        )
        .await?;
        self.overwrite_subscription(account, subscription);

        tracing::info!(
            email = %account.email,
            subscription_id = %subscription_id,
            outcome = ?outcome,
            "Account subscribed"
        );

        Ok(outcome)
    }

    /// Cancel the account's subscription, keeping the canceled record locally
    pub async fn unsubscribe(&self, account: &mut Account) -> BillingResult<Subscription> {
        let subscription_id = match account.subscription() {
            Some(sub) if !sub.is_canceled() => sub.id.clone(),
            _ => return Err(BillingError::NoActiveSubscription),
        };

        let subscription = with_timeout(
            self.call_timeout,
            "cancel_subscription",
            self.provider.cancel_subscription(&subscription_id),
        )
        .await?;
        self.overwrite_subscription(account, subscription.clone());

        tracing::info!(
            email = %account.email,
            subscription_id = %subscription_id,
            status = %subscription.status,
            "Account unsubscribed"
        );

        Ok(subscription)
    }

    /// Build the dashboard snapshot, lazily creating billing objects on a cold start
    pub async fn dashboard(
        &self,
        account: &mut Account,
        display_subscription: bool,
    ) -> BillingResult<DashboardSnapshot> {
        let subscription = SubscriptionView::from(self.ensure_subscription(account).await?);

        Ok(DashboardSnapshot {
            email: account.email.clone(),
            tracking_id: account.tracking_id.clone(),
            subscription,
            payment_source: account.payment_source(),
            display_subscription,
        })
    }

    /// Overwrite the local subscription with the provider's authoritative copy
    fn overwrite_subscription(&self, account: &mut Account, subscription: Subscription) {
        match account.customer.as_mut() {
            Some(customer) => customer.set_subscription(subscription),
            None => tracing::warn!(
                email = %account.email,
                subscription_id = %subscription.id,
                "Dropping subscription update for account without customer"
            ),
        }
    }
}
