//! Billing error taxonomy
//!
//! Card errors are the only provider failures callers are expected to turn
//! into a user-facing message. Every other provider failure is folded into
//! `StripeApi`, `StripeUnreachable` or `Timeout` and treated as an upstream
//! fault.

use stripe::{ErrorType, StripeError};
use subledger_shared::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("No payment token provided")]
    MissingPaymentToken,

    #[error("This account does not have an active subscription")]
    NoActiveSubscription,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Card error: {message}")]
    Card {
        message: String,
        decline_code: Option<String>,
    },

    /// Stripe answered with an error. `http_status` is `None` when the
    /// failure happened on our side of the request.
    #[error("Stripe API error: {message}")]
    StripeApi {
        message: String,
        http_status: Option<u16>,
    },

    #[error("Could not reach Stripe: {0}")]
    StripeUnreachable(String),

    #[error("Stripe request timed out during {0}")]
    Timeout(&'static str),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Unprocessable {event_type} event: {reason}")]
    WebhookPayload { event_type: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Client mistakes that never reached the provider or the store
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            BillingError::MissingPaymentToken
                | BillingError::NoActiveSubscription
                | BillingError::InvalidInput(_)
        )
    }

    pub fn is_card_error(&self) -> bool {
        matches!(self, BillingError::Card { .. })
    }

    pub fn stripe_api(message: impl Into<String>, http_status: Option<u16>) -> Self {
        BillingError::StripeApi {
            message: message.into(),
            http_status,
        }
    }

    /// Failures worth retrying for idempotent provider reads: connection
    /// errors, timeouts, rate limiting and 5xx responses
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::StripeUnreachable(_) | BillingError::Timeout(_) => true,
            BillingError::StripeApi {
                http_status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<StripeError> for BillingError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Stripe(request) if matches!(request.error_type, ErrorType::Card) => {
                BillingError::Card {
                    message: request
                        .message
                        .unwrap_or_else(|| "Your card was declined".to_string()),
                    decline_code: request.decline_code,
                }
            }
            StripeError::Stripe(request) => {
                let http_status = Some(request.http_status);
                let message = request
                    .message
                    .unwrap_or_else(|| "Unknown error".to_string());
                BillingError::StripeApi {
                    message,
                    http_status,
                }
            }
            StripeError::ClientError(detail) => BillingError::StripeUnreachable(detail),
            StripeError::Timeout => BillingError::Timeout("stripe request"),
            other => BillingError::stripe_api(other.to_string(), None),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
