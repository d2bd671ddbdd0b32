//! Error types for OtpGate

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for OtpGate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Message too long: {length} characters would need {parts} parts (max {max_parts})")]
    MessageTooLong {
        length: usize,
        parts: u32,
        max_parts: u32,
    },

    #[error("No rate prefix matches destination {0}")]
    UnknownDestination(String),

    #[error("Prefix '{prefix}' has no {class} price configured for {currency}")]
    RateNotConfigured {
        prefix: String,
        currency: String,
        class: String,
    },

    #[error("Insufficient balance: {required} required, {available} available")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("IP address not allowed: {0}")]
    ForbiddenIp(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Webhook delivery failed: {0}")]
    WebhookDeliveryFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for OtpGate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a validation error on a named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Validation { .. } => 400,
            Error::MessageTooLong { .. } => 400,
            Error::UnknownDestination(_) => 400,
            Error::RateNotConfigured { .. } => 400,
            Error::InsufficientBalance { .. } => 402,
            Error::RateLimited => 429,
            Error::ForbiddenIp(_) => 403,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::InvalidTransition { .. } => 409,
            Error::WebhookDeliveryFailed(_) => 500,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            Error::UnknownDestination(_) => "UNKNOWN_DESTINATION",
            Error::RateNotConfigured { .. } => "RATE_NOT_CONFIGURED",
            Error::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Error::RateLimited => "RATE_LIMITED",
            Error::ForbiddenIp(_) => "FORBIDDEN_IP",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::WebhookDeliveryFailed(_) => "WEBHOOK_DELIVERY_FAILED",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// The request field the error refers to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => Some(field),
            Error::MessageTooLong { .. } => Some("message"),
            Error::UnknownDestination(_) | Error::RateNotConfigured { .. } => Some("to"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("to", "bad").status_code(), 400);
        assert_eq!(Error::RateLimited.status_code(), 429);
        assert_eq!(
            Error::InsufficientBalance {
                required: dec!(10),
                available: dec!(5),
            }
            .status_code(),
            402
        );
        assert_eq!(
            Error::InvalidTransition {
                from: "approved".into(),
                to: "rejected".into(),
            }
            .status_code(),
            409
        );
    }

    #[test]
    fn test_field_reporting() {
        assert_eq!(Error::validation("sender", "too long").field(), Some("sender"));
        assert_eq!(
            Error::MessageTooLong {
                length: 2000,
                parts: 14,
                max_parts: 6,
            }
            .field(),
            Some("message")
        );
        assert_eq!(Error::UnknownDestination("+1555".into()).field(), Some("to"));
        assert_eq!(Error::RateLimited.field(), None);
    }
}
