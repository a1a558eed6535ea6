//! API error type and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subledger_billing::BillingError;
use subledger_shared::StoreError;

use crate::analytics::AnalyticsError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// The provider rejected the payment method; the message is shown to the user
    #[error("{message}")]
    CardDeclined {
        message: String,
        decline_code: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::CardDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::CardDeclined { .. } => "card_declined",
            ApiError::NotFound(_) => "not_found",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Database(_) => "database_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side detail stays in the logs
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                "Internal server error".to_string()
            }
            ApiError::Upstream(detail) => {
                tracing::error!(error = %detail, "Billing provider request failed");
                "Billing provider unavailable, please try again".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": message,
            "code": self.code(),
        });
        if let ApiError::CardDeclined {
            decline_code: Some(code),
            ..
        } = &self
        {
            body["decline_code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::MissingPaymentToken
            | BillingError::NoActiveSubscription
            | BillingError::InvalidInput(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::InvalidPayload(_) => ApiError::BadRequest(err.to_string()),
            BillingError::Card {
                message,
                decline_code,
            } => ApiError::CardDeclined {
                message,
                decline_code,
            },
            BillingError::StripeApi { .. }
            | BillingError::StripeUnreachable(_)
            | BillingError::Timeout(_) => {
                ApiError::Upstream(err.to_string())
            }
            BillingError::Store(store) => store.into(),
            BillingError::WebhookPayload { .. } | BillingError::Config(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(email) => ApiError::NotFound(format!("Account {}", email)),
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(err: AnalyticsError) -> Self {
        ApiError::Upstream(err.to_string())
    }
}
