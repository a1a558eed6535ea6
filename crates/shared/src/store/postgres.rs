use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use super::{AccountStore, StoreError, StoreResult};
use crate::model::{Account, Customer};

/// Database row type for the accounts table
#[derive(Debug, FromRow)]
struct AccountRow {
    email: String,
    tracking_id: String,
    customer: Option<Json<Customer>>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            email: row.email,
            tracking_id: row.tracking_id,
            customer: row.customer.map(|Json(c)| c),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed account store; the mirrored customer is kept as JSONB
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get_by_email(&self, email: &str, create: bool) -> StoreResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT email, tracking_id, customer, created_at, updated_at
            FROM accounts
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None if create => Ok(Account::new(email)),
            None => Err(StoreError::NotFound(email.to_string())),
        }
    }

    async fn put(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (email, tracking_id, customer, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (email) DO UPDATE SET
                tracking_id = EXCLUDED.tracking_id,
                customer = EXCLUDED.customer,
                updated_at = NOW()
            "#,
        )
        .bind(&account.email)
        .bind(&account.tracking_id)
        .bind(account.customer.as_ref().map(Json))
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(email = %account.email, error = %e, "Failed to persist account");
            StoreError::from(e)
        })?;

        Ok(())
    }

    async fn list_with_customer(&self) -> StoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            r#"
            SELECT email, tracking_id, customer, created_at, updated_at
            FROM accounts
            WHERE customer IS NOT NULL
            ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Account::from).collect())
    }
}
