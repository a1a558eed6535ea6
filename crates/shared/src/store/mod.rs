//! Account persistence
//!
//! The store maps an email to an `Account`. `get_by_email` with
//! `create = true` returns a fresh in-memory account when none exists; it is
//! only written on the next `put`. `put` is an upsert and last write wins.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::model::Account;

pub use memory::InMemoryAccountStore;
pub use postgres::PgAccountStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            // A stored customer document that no longer matches the model
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(format!("Migration failed: {}", err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Look up an account, optionally materializing a new one when absent
    async fn get_by_email(&self, email: &str, create: bool) -> StoreResult<Account>;

    /// Insert or replace the account
    async fn put(&self, account: &Account) -> StoreResult<()>;

    /// Every account that holds a customer reference
    async fn list_with_customer(&self) -> StoreResult<Vec<Account>>;
}

/// Create a Postgres connection pool
pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply bundled migrations
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
