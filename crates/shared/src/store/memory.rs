use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{AccountStore, StoreError, StoreResult};
use crate::model::Account;

/// Process-local store, used when no database is configured and in tests
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_by_email(&self, email: &str, create: bool) -> StoreResult<Account> {
        if let Some(account) = self.accounts.read().await.get(email) {
            return Ok(account.clone());
        }
        if create {
            Ok(Account::new(email))
        } else {
            Err(StoreError::NotFound(email.to_string()))
        }
    }

    async fn put(&self, account: &Account) -> StoreResult<()> {
        let mut stored = account.clone();
        stored.updated_at = OffsetDateTime::now_utc();
        self.accounts
            .write()
            .await
            .insert(stored.email.clone(), stored);
        Ok(())
    }

    async fn list_with_customer(&self) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.customer.is_some())
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(accounts)
    }
}
