use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Misconfiguration cannot be recovered by reconnecting or retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<&'static str>,
    pub retryable: bool,
}

impl From<&RelayError> for ErrorReport {
    fn from(err: &RelayError) -> Self {
        let (code, suggestion, retryable) = match err {
            RelayError::Config(_) => (
                "CONFIG_ERROR",
                Some("Fix the configuration file and restart (see `courier check`)"),
                false,
            ),
            RelayError::Transport(_) => (
                "TRANSPORT_ERROR",
                Some("Check the IMAP host, credentials and network; the session reconnects on its own"),
                true,
            ),
            RelayError::Parse(_) => ("PARSE_ERROR", None, false),
            RelayError::Delivery(_) => (
                "DELIVERY_ERROR",
                Some("Check the Slack token, channel id or webhook URL"),
                true,
            ),
            RelayError::Internal(_) => ("INTERNAL_ERROR", Some("Unexpected error"), true),
        };
        Self {
            code,
            message: err.to_string(),
            suggestion,
            retryable,
        }
    }
}

impl ErrorReport {
    pub fn to_compact(&self) -> String {
        let mut parts = vec![format!("[{}] {}", self.code, self.message)];
        if let Some(s) = self.suggestion {
            parts.push(format!("Suggestion: {s}"));
        }
        if self.retryable {
            parts.push("(retryable)".to_string());
        }
        parts.join(" | ")
    }
}
