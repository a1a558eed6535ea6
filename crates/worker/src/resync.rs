//! Drift resync
//!
//! Re-fetches every known customer from Stripe and applies it through the
//! same guarded overwrite the webhook path uses. Picks up missed webhooks and
//! store writes that failed after a successful provider mutation.

use std::sync::Arc;

use subledger_billing::{InvariantChecker, WebhookHandler, WebhookOutcome};
use subledger_shared::AccountStore;
use tracing::{error, info, warn};

/// One account the resync could not reconcile
#[derive(Debug)]
pub struct ResyncFailure {
    pub email: String,
    pub customer_id: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ResyncReport {
    pub accounts: usize,
    pub applied: usize,
    pub ignored: usize,
    pub failures: Vec<ResyncFailure>,
    pub violations: usize,
}

pub struct ResyncJob {
    store: Arc<dyn AccountStore>,
    webhooks: WebhookHandler,
    checker: InvariantChecker,
}

impl ResyncJob {
    pub fn new(store: Arc<dyn AccountStore>, webhooks: WebhookHandler) -> Self {
        Self {
            checker: InvariantChecker::new(store.clone()),
            store,
            webhooks,
        }
    }

    pub async fn run(&self) -> ResyncReport {
        let mut report = ResyncReport::default();

        let accounts = match self.store.list_with_customer().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(error = %e, "Failed to list accounts for resync");
                return report;
            }
        };
        report.accounts = accounts.len();

        for account in accounts {
            let Some(customer_id) = account.customer_id().map(str::to_owned) else {
                continue;
            };

            match self.webhooks.sync_customer(&customer_id).await {
                Ok(WebhookOutcome::Applied) => report.applied += 1,
                Ok(outcome) => {
                    warn!(
                        email = %account.email,
                        customer_id = %customer_id,
                        outcome = ?outcome,
                        "Resync left account untouched"
                    );
                    report.ignored += 1;
                }
                Err(e) => report.failures.push(ResyncFailure {
                    email: account.email.clone(),
                    customer_id,
                    error: e.to_string(),
                }),
            }
        }

        match self.checker.run_all_checks().await {
            Ok(summary) => {
                report.violations = summary.violations.len();
                for violation in &summary.violations {
                    warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        emails = ?violation.emails,
                        "{}",
                        violation.description
                    );
                }
            }
            Err(e) => error!(error = %e, "Invariant checks failed to run"),
        }

        report
    }
}

/// Log results of a resync cycle
pub fn log_resync_report(report: &ResyncReport) {
    info!(
        accounts = report.accounts,
        applied = report.applied,
        ignored = report.ignored,
        errors = report.failures.len(),
        violations = report.violations,
        "Resync cycle complete"
    );

    for failure in &report.failures {
        error!(
            email = %failure.email,
            customer_id = %failure.customer_id,
            error = %failure.error,
            "Failed to resync customer"
        );
    }
}
