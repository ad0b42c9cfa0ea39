//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the lead billing core
///
/// Variants line up with how callers must react: validation and not-found
/// errors are caller mistakes, `MissingConfiguration` means an account is not
/// provisioned for billing, and the upstream variants must surface so the
/// caller retries with the same idempotency key.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing billing configuration: {0}")]
    MissingConfiguration(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ambiguous match: {0}")]
    AmbiguousMatch(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Invitation provider error: {0}")]
    InvitationProvider(String),

    #[error("Email delivery error: {0}")]
    Email(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the failure came from an external provider call
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_) | BillingError::InvitationProvider(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}
