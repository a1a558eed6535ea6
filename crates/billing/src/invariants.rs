//! Billing Invariants Module
//!
//! Runnable consistency checks over stored accounts. They can be run after
//! a resync or a webhook replay to confirm the local mirror still agrees
//! with itself.
//!
//! ## Design Principles
//!
//! 1. **Explanatory**: Violations include enough context to debug
//! 2. **Non-destructive**: Checks only read, never write

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subledger_shared::{Account, AccountStore};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub emails: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the account points at a subscription it does not own
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Number of accounts inspected
    pub accounts_checked: usize,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

const SUBSCRIPTION_BELONGS_TO_CUSTOMER: &str = "subscription_belongs_to_customer";
const CUSTOMER_EMAIL_MATCHES: &str = "customer_email_matches";
const SINGLE_LIVE_SUBSCRIPTION: &str = "single_live_subscription";

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn AccountStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks over every account holding a customer
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let accounts = self.store.list_with_customer().await?;

        let violations: Vec<InvariantViolation> =
            accounts.iter().flat_map(Self::check_account).collect();

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            accounts_checked: accounts.len(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Every check against a single account
    pub fn check_account(account: &Account) -> Vec<InvariantViolation> {
        Self::available_checks()
            .into_iter()
            .filter_map(|name| Self::run_check(name, account))
            .collect()
    }

    /// Run a single invariant check by name
    pub fn run_check(name: &str, account: &Account) -> Option<InvariantViolation> {
        match name {
            SUBSCRIPTION_BELONGS_TO_CUSTOMER => Self::check_subscription_belongs_to_customer(account),
            CUSTOMER_EMAIL_MATCHES => Self::check_customer_email_matches(account),
            SINGLE_LIVE_SUBSCRIPTION => Self::check_single_live_subscription(account),
            _ => None,
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SUBSCRIPTION_BELONGS_TO_CUSTOMER,
            CUSTOMER_EMAIL_MATCHES,
            SINGLE_LIVE_SUBSCRIPTION,
        ]
    }

    /// Invariant 1: the tracked subscription belongs to the account's customer
    fn check_subscription_belongs_to_customer(account: &Account) -> Option<InvariantViolation> {
        let customer_id = account.customer_id()?;
        let subscription = account.subscription()?;
        let owner = subscription.customer.as_deref()?;

        (owner != customer_id).then(|| InvariantViolation {
            invariant: SUBSCRIPTION_BELONGS_TO_CUSTOMER.to_string(),
            emails: vec![account.email.clone()],
            description: format!(
                "Subscription {} belongs to {} but the account tracks customer {}",
                subscription.id, owner, customer_id
            ),
            context: serde_json::json!({
                "subscription_id": subscription.id,
                "subscription_customer": owner,
                "account_customer": customer_id,
            }),
            severity: ViolationSeverity::Critical,
        })
    }

    /// Invariant 2: the mirrored customer carries the account's email
    fn check_customer_email_matches(account: &Account) -> Option<InvariantViolation> {
        let customer = account.customer.as_ref()?;
        let email = customer.email.as_deref()?;

        (!email.eq_ignore_ascii_case(&account.email)).then(|| InvariantViolation {
            invariant: CUSTOMER_EMAIL_MATCHES.to_string(),
            emails: vec![account.email.clone()],
            description: format!(
                "Customer {} has email {} but is stored on account {}",
                customer.id, email, account.email
            ),
            context: serde_json::json!({
                "customer_id": customer.id,
                "customer_email": email,
            }),
            severity: ViolationSeverity::High,
        })
    }

    /// Invariant 3: at most one non-canceled subscription per customer
    fn check_single_live_subscription(account: &Account) -> Option<InvariantViolation> {
        let customer = account.customer.as_ref()?;
        let live = customer.live_subscription_count();

        (live > 1).then(|| InvariantViolation {
            invariant: SINGLE_LIVE_SUBSCRIPTION.to_string(),
            emails: vec![account.email.clone()],
            description: format!("Customer has {} live subscriptions (expected at most 1)", live),
            context: serde_json::json!({
                "customer_id": customer.id,
                "live_subscriptions": live,
            }),
            severity: ViolationSeverity::Medium,
        })
    }
}
