use http::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Field name → user-facing message, ordered for stable rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message for `field`; the first message recorded for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field, message)?;
            first = false;
        }
        Ok(())
    }
}

impl From<validator::ValidationErrors> for FieldErrors {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields = FieldErrors::new();
        for (field, errs) in errors.field_errors() {
            if let Some(err) = errs.first() {
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("invalid {}", field));
                fields.add(field.to_string(), message);
            }
        }
        fields
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Validation error: {0}")]
    FieldValidation(FieldErrors),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    #[error("Gateway callback signature mismatch")]
    SignatureMismatch,

    #[error("Payment declined ({code}): {message}")]
    PaymentDeclined { code: String, message: String },

    #[error("Bank transfer was not confirmed before the payment window closed")]
    PaymentTimeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::FieldValidation(err.into())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) | Self::FieldValidation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidOperation(_) => StatusCode::CONFLICT,
            Self::TransportError(_) | Self::OrderCreation(_) => StatusCode::BAD_GATEWAY,
            Self::SignatureMismatch => StatusCode::UNAUTHORIZED,
            Self::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::PaymentTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SerializationError(_) | Self::ConfigError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the message shown to the shopper.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::SerializationError(_) | Self::ConfigError(_) | Self::Other(_) => {
                "Internal error".to_string()
            }
            Self::TransportError(_) | Self::OrderCreation(_) => {
                "We could not reach the order service. Please try again.".to_string()
            }
            Self::SignatureMismatch => {
                "The payment result could not be verified. Please retry checkout.".to_string()
            }
            Self::InvalidOperation(msg) => msg.clone(),
            _ => self.to_string(),
        }
    }

    /// Whether the shopper can simply retry the same action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportError(_) | Self::OrderCreation(_))
    }

    /// Field-level errors, when this is a validation failure.
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Self::FieldValidation(fields) => Some(fields),
            _ => None,
        }
    }
}
