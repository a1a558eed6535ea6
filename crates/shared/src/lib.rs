// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subledger Shared Types
//!
//! Domain model and persistence seams shared by the API server, the billing
//! core and the background worker.
//!
//! ## Contents
//!
//! - **Model**: `Account` plus the locally mirrored provider objects
//!   (`Customer`, `Subscription`, `PaymentSource`)
//! - **Store**: the `AccountStore` trait with in-memory and Postgres backends
//! - **Locks**: per-account async mutexes for read-modify-write sequences

pub mod locks;
pub mod model;
pub mod store;

pub use locks::AccountLocks;
pub use model::{
    Account, CardSummary, Customer, PaymentSource, PlanRef, ProviderList, Subscription,
    SubscriptionItem, SubscriptionStatus,
};
pub use store::{
    create_pool, run_migrations, AccountStore, InMemoryAccountStore, PgAccountStore, StoreError,
    StoreResult,
};
