//! Error types for the Portcullis gateway
//!
//! This module defines the failure taxonomy of the request-processing
//! pipeline. Every variant maps to an HTTP-style status, a machine-readable
//! code and a client-safe message; no internal detail crosses the transport
//! boundary unwrapped.

use thiserror::Error;

/// Main error type for pipeline failures
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No deployed API matches the request host/path (routing miss)
    #[error("No API matching request: {host}{path}")]
    NoMatchingApi { host: String, path: String },

    /// No security plan accepted the request and no keyless fallback exists
    #[error("Authentication required")]
    AuthenticationRequired,

    /// A security plan matched but its authentication chain failed
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Authenticated but not allowed
    #[error("Authorization failed: {reason}")]
    AuthorizationFailed { reason: String },

    /// Explicit policy failure or uncaught policy fault
    #[error("Policy '{policy}' failed: {message}")]
    PolicyExecution {
        policy: String,
        status: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Load balancer exhausted: no UP endpoint to route to
    #[error("No upstream available for API '{api}'")]
    NoUpstreamAvailable { api: String },

    /// Per-consumer quota exceeded
    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimitExceeded {
        limit: u64,
        window_secs: u64,
        retry_after_secs: u64,
    },

    /// Upstream call did not answer within the configured timeout
    #[error("Upstream timeout: {endpoint} after {duration_ms}ms")]
    UpstreamTimeout { endpoint: String, duration_ms: u64 },

    /// Upstream connection could not be established
    #[error("Upstream connect error: {endpoint} - {message}")]
    UpstreamConnect { endpoint: String, message: String },

    /// Everything else; never shown to clients verbatim
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::NoMatchingApi { .. } => 404,
            Self::AuthenticationRequired => 401,
            Self::AuthenticationFailed { .. } => 401,
            Self::AuthorizationFailed { .. } => 403,
            Self::PolicyExecution { status, .. } => *status,
            Self::NoUpstreamAvailable { .. } => 503,
            Self::RateLimitExceeded { .. } => 429,
            Self::UpstreamTimeout { .. } => 504,
            Self::UpstreamConnect { .. } => 502,
            Self::Internal { .. } => 500,
        }
    }

    /// Machine-readable error code, stable across releases
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoMatchingApi { .. } => "NO_MATCHING_API",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Self::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            Self::PolicyExecution { .. } => "POLICY_EXECUTION_FAILURE",
            Self::NoUpstreamAvailable { .. } => "NO_UPSTREAM_AVAILABLE",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::UpstreamConnect { .. } => "UPSTREAM_CONNECT_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Get a client-safe error message (without internal details)
    pub fn client_message(&self) -> String {
        match self {
            Self::NoMatchingApi { .. } => "No API found for this request".to_string(),
            Self::AuthenticationRequired => "Authentication required".to_string(),
            Self::AuthenticationFailed { .. } => "Authentication failed".to_string(),
            Self::AuthorizationFailed { .. } => "Access denied".to_string(),
            Self::PolicyExecution { message, .. } => message.clone(),
            Self::NoUpstreamAvailable { .. } => "Service temporarily unavailable".to_string(),
            Self::RateLimitExceeded { .. } => "Rate limit exceeded".to_string(),
            Self::UpstreamTimeout { .. } => "Gateway timeout".to_string(),
            Self::UpstreamConnect { .. } => "Bad gateway".to_string(),
            Self::Internal { .. } => "Internal server error".to_string(),
        }
    }

    /// Whether the reactor may retry this failure on another endpoint
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamConnect { .. } | Self::UpstreamTimeout { .. }
        )
    }

    /// Create an internal error from a message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a policy execution failure
    pub fn policy(policy: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::PolicyExecution {
            policy: policy.into(),
            status,
            message: message.into(),
            source: None,
        }
    }
}
