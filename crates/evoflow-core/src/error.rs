use thiserror::Error;

/// Why an admission guard refused an outbound model call.
///
/// Returned as a value by the guards; the caller decides whether to fail the
/// node, the invocation, or the generation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionRejection {
    #[error("Rate limit reached: {in_window}/{max_requests} requests within {window_ms}ms")]
    RateLimited {
        in_window: usize,
        max_requests: usize,
        window_ms: u64,
    },

    #[error("Spending limit reached: ${current:.4} spent of ${limit:.4} allowed")]
    SpendLimit { current: f64, limit: f64 },
}

/// Classification of a model-provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    Connection,
    /// The provider itself throttled the request (HTTP 429).
    Throttled,
    Server(u16),
    Client(u16),
    Other,
}

impl ProviderErrorKind {
    /// Whether a fresh attempt has a chance of succeeding.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::Throttled | Self::Server(_)
        )
    }

    /// Map an HTTP status code to a provider error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::Throttled,
            408 => Self::Timeout,
            500..=599 => Self::Server(status),
            400..=499 => Self::Client(status),
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connection => write!(f, "connection"),
            Self::Throttled => write!(f, "throttled"),
            Self::Server(code) => write!(f, "server error {}", code),
            Self::Client(code) => write!(f, "client error {}", code),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvoflowError {
    // Model errors
    #[error("Model provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("Malformed structured output: {0}")]
    MalformedOutput(String),

    #[error("Model call refused: {0}")]
    Admission(#[from] AdmissionRejection),

    #[error("Unknown model in pricing catalog: {0}")]
    UnknownModel(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Workflow errors
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Unsupported coordination type: {0}")]
    UnsupportedCoordination(String),

    #[error("Node '{0}' not found in workflow")]
    NodeNotFound(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvoflowError {
    /// Whether the dispatch boundary should try the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { kind, .. } => kind.is_transient(),
            Self::MalformedOutput(_) => true,
            _ => false,
        }
    }

    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EvoflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EvoflowError::provider(ProviderErrorKind::Timeout, "t").is_retryable());
        assert!(EvoflowError::provider(ProviderErrorKind::from_status(503), "x").is_retryable());
        assert!(!EvoflowError::provider(ProviderErrorKind::from_status(401), "x").is_retryable());
        assert!(EvoflowError::MalformedOutput("bad json".into()).is_retryable());
        assert!(!EvoflowError::Cancelled.is_retryable());
        assert!(!EvoflowError::Admission(AdmissionRejection::SpendLimit {
            current: 1.0,
            limit: 1.0
        })
        .is_retryable());
    }

    #[test]
    fn test_rejection_messages_carry_numbers() {
        let r = AdmissionRejection::SpendLimit {
            current: 2.5,
            limit: 2.0,
        };
        let text = r.to_string();
        assert!(text.contains("2.5000"));
        assert!(text.contains("2.0000"));

        let r = AdmissionRejection::RateLimited {
            in_window: 10,
            max_requests: 10,
            window_ms: 1000,
        };
        assert!(r.to_string().contains("10/10"));
    }
}
