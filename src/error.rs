use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("provider {provider} unavailable after retries")]
    ProviderUnavailable { provider: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("search failed for {provider}: {message}")]
    SearchFailed { provider: String, message: String },

    #[error("evidence store error: {0}")]
    Store(String),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl ResearchError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::ProviderUnavailable { provider } => Some(provider),
            Self::SearchFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// True for failures worth retrying: transport errors, 5xx, rate limits.
    /// Auth failures, 4xx, and parse errors are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Request(_) => true,
            Self::Upstream { status, .. } => status.is_none_or(|s| s >= 500),
            _ => false,
        }
    }

    /// Produce a sanitized error message safe for task records and API clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider} — try again shortly")
            }
            Self::Upstream { provider, .. } => {
                format!("upstream error from {provider}")
            }
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::ProviderUnavailable { provider } => {
                format!("{provider} is unavailable")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::SearchFailed { provider, .. } => format!("search via {provider} failed"),
            Self::Store(_) => "evidence store rejected the operation".to_string(),
            Self::Cancelled(_) => "cancelled".to_string(),
            Self::InvalidRequest(msg) => format!("invalid request: {msg}"),
            Self::InvariantViolation(msg) => format!("internal invariant violated: {msg}"),
            Self::Request(_) => "request to provider failed".to_string(),
        }
    }
}
