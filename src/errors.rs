use thiserror::Error;

use crate::store::StoreError;

/// Typed error hierarchy used at module boundaries. Leaf helpers stay on
/// `anyhow::Result`; the `Internal` variant bridges them via `?`.
///
/// Every variant maps to a stable machine-readable code via
/// [`PryxError::code`]; that code is what gateway clients see. Human
/// messages may change between releases, codes must not.
#[derive(Debug, Error)]
pub enum PryxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded")]
    RateLimit { retry_after: Option<u64> },

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Provider stream stalled (no events within inactivity window)")]
    ProviderStalled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Policy denied {tool}: {reason}")]
    PolicyDenied { tool: String, reason: String },

    #[error("Budget exceeded: {0}")]
    Budget(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using PryxError.
pub type PryxResult<T> = std::result::Result<T, PryxError>;

impl PryxError {
    /// Stable machine-readable code surfaced to gateway clients.
    pub fn code(&self) -> &'static str {
        match self {
            PryxError::Config(_) => "config.invalid",
            PryxError::Auth(_) => "auth.invalid",
            PryxError::RateLimit { .. } => "provider.rate_limited",
            PryxError::Provider { .. } => "provider.error",
            PryxError::ProviderStalled => "provider.stalled",
            PryxError::Store(e) => e.code(),
            PryxError::Tool { .. } => "tool.failed",
            PryxError::PolicyDenied { .. } => "policy.denied",
            PryxError::Budget(_) => "budget.exceeded",
            PryxError::Integrity(_) => "system.integrity",
            PryxError::Cancelled => "turn.cancelled",
            PryxError::Fatal(_) => "fatal",
            PryxError::Internal(_) => "internal",
        }
    }

    /// Whether this error is retryable (rate limits, transient provider or
    /// store errors). Auth and policy failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            PryxError::RateLimit { .. } => true,
            PryxError::Provider { retryable, .. } => *retryable,
            PryxError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
