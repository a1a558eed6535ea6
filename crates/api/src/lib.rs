// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps owned billing messages
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Subledger API Library
//!
//! HTTP surface for subscription management: the dashboard, the subscribe
//! and unsubscribe form posts, the Stripe webhook and the direct analytics
//! endpoint.

pub mod analytics;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use analytics::{AnalyticsSink, Tracker, TrackingEvent};
pub use config::{Config, SubscriptionPolicy};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
