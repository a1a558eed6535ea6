//! Application state

use std::sync::Arc;

use subledger_billing::BillingService;
use subledger_shared::{AccountLocks, AccountStore};

use crate::{
    analytics::Tracker,
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Validity window used when this service issues tokens (local tooling only)
const TOKEN_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn AccountStore>,
    pub billing: Arc<BillingService>,
    /// Same lock set the billing webhook handler uses
    pub locks: AccountLocks,
    pub tracker: Tracker,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn AccountStore>,
        billing: BillingService,
        locks: AccountLocks,
        tracker: Tracker,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, TOKEN_EXPIRY_HOURS);

        if billing.webhooks.verifies_signatures() {
            tracing::info!("Stripe webhook signature verification enabled");
        }

        Self {
            config: Arc::new(config),
            store,
            billing: Arc::new(billing),
            locks,
            tracker,
            jwt_manager,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
