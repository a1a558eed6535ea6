//! Account model and locally mirrored provider objects
//!
//! Mirror types follow the billing provider's JSON wire shape so that the
//! same structs decode webhook payloads and SDK responses. The provider is
//! the source of truth: these are caches, replaced wholesale on sync.

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Paginated list envelope used by the provider (`{"object": "list", "data": [...]}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl<T> Default for ProviderList<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
            url: None,
        }
    }
}

impl<T> ProviderList<T> {
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

/// Subscription status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    /// Any status this build does not know about yet
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to a plan or price object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    #[serde(default)]
    pub price: Option<PlanRef>,
    #[serde(default)]
    pub plan: Option<PlanRef>,
}

/// Mirrored provider subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Owning customer ID (the provider may send it expanded)
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub plan: Option<PlanRef>,
    #[serde(default)]
    pub items: Option<ProviderList<SubscriptionItem>>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub created: Option<i64>,
}

impl Subscription {
    /// Plan identifier, from the legacy `plan` field or the first item's price
    pub fn plan_id(&self) -> Option<&str> {
        if let Some(plan) = &self.plan {
            return Some(plan.id.as_str());
        }
        self.items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref().or(item.plan.as_ref()))
            .map(|p| p.id.as_str())
    }

    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
    }

    pub fn trial_end_at(&self) -> Option<OffsetDateTime> {
        self.trial_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
}

/// A payment source attached to a customer (card or card-backed source)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSource {
    pub id: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<i64>,
    #[serde(default)]
    pub exp_year: Option<i64>,
    /// Card details for `source` objects, which nest them one level down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardDetails>,
}

impl PaymentSource {
    pub fn card_summary(&self) -> Option<CardSummary> {
        let brand = self
            .brand
            .as_deref()
            .or_else(|| self.card.as_ref().and_then(|c| c.brand.as_deref()))?;
        let last_four = self
            .last4
            .as_deref()
            .or_else(|| self.card.as_ref().and_then(|c| c.last4.as_deref()))?;
        Some(CardSummary {
            brand: brand.to_string(),
            last_four: last_four.to_string(),
        })
    }
}

/// Masked card details safe to render
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSummary {
    pub brand: String,
    pub last_four: String,
}

/// Mirrored provider customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    /// `None` when the payload did not carry the list at all
    #[serde(default)]
    pub sources: Option<ProviderList<PaymentSource>>,
    /// `None` when the payload did not carry the list at all
    #[serde(default)]
    pub subscriptions: Option<ProviderList<Subscription>>,
    #[serde(default)]
    pub delinquent: Option<bool>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub created: Option<i64>,
}

impl Customer {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: Some(email.into()),
            sources: Some(ProviderList::default()),
            subscriptions: Some(ProviderList::default()),
            delinquent: None,
            deleted: false,
            created: None,
        }
    }

    /// The subscription this account tracks: the first one the provider lists
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscriptions.as_ref().and_then(|s| s.data.first())
    }

    pub fn subscription_mut(&mut self) -> Option<&mut Subscription> {
        self.subscriptions.as_mut().and_then(|s| s.data.first_mut())
    }

    /// Make `subscription` the tracked subscription, replacing any copy with the same ID
    pub fn set_subscription(&mut self, subscription: Subscription) {
        let list = self.subscriptions.get_or_insert_with(ProviderList::default);
        list.data.retain(|s| s.id != subscription.id);
        list.data.insert(0, subscription);
    }

    /// Add `subscription` unless the list already carries its ID. A canceled
    /// one goes last so it stays tracked only while nothing live is listed.
    pub fn merge_subscription(&mut self, subscription: Subscription) {
        let list = self.subscriptions.get_or_insert_with(ProviderList::default);
        if list.data.iter().any(|s| s.id == subscription.id) {
            return;
        }
        if subscription.is_canceled() {
            list.data.push(subscription);
        } else {
            list.data.insert(0, subscription);
        }
    }

    pub fn primary_source(&self) -> Option<&PaymentSource> {
        self.sources.as_ref().and_then(|s| s.data.first())
    }

    /// Subscriptions the provider still considers live
    pub fn live_subscription_count(&self) -> usize {
        self.subscriptions
            .as_ref()
            .map(|s| s.data.iter().filter(|sub| !sub.is_canceled()).count())
            .unwrap_or(0)
    }
}

/// Internal account record, keyed by email
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub email: String,
    pub tracking_id: String,
    pub customer: Option<Customer>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// Fresh account with a random tracking ID and no billing references
    pub fn new(email: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            email: email.into(),
            tracking_id: Uuid::new_v4().to_string(),
            customer: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id.as_str())
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.customer.as_ref().and_then(Customer::subscription)
    }

    pub fn subscription_mut(&mut self) -> Option<&mut Subscription> {
        self.customer.as_mut().and_then(Customer::subscription_mut)
    }

    pub fn has_active_subscription(&self) -> bool {
        self.subscription()
            .is_some_and(|s| s.status == SubscriptionStatus::Active)
    }

    pub fn payment_source(&self) -> Option<CardSummary> {
        self.customer
            .as_ref()
            .and_then(Customer::primary_source)
            .and_then(PaymentSource::card_summary)
    }
}

/// Accept either a bare ID string or an expanded object carrying an `id`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(id)) => Some(id),
        Some(serde_json::Value::Object(map)) => map
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned),
        _ => None,
    })
}
