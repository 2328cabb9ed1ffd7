//! Built-in policies.
//!
//! `transform-headers` adds and removes request/response headers, `mock`
//! short-circuits with a canned response, and `rate-limit` charges the
//! request against the shared rate limiter and rejects it with 429 when the
//! quota is exhausted.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use portcullis_common::{GatewayError, GatewayResult, TimeWindow};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use super::{Policy, PolicyFactory, PolicyOutcome};
use crate::context::{ExecutionContext, GatewayResponse};
use crate::ratelimit::{RateLimitKey, RateLimiter};

// ============================================================================
// transform-headers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TransformHeadersConfig {
    #[serde(default)]
    request_add: HashMap<String, String>,
    #[serde(default)]
    request_remove: Vec<String>,
    #[serde(default)]
    response_add: HashMap<String, String>,
    #[serde(default)]
    response_remove: Vec<String>,
}

/// Adds/removes headers on either side of the proxy call
pub struct TransformHeadersPolicy {
    config: TransformHeadersConfig,
}

fn apply_headers(
    headers: &mut http::HeaderMap,
    add: &HashMap<String, String>,
    remove: &[String],
) {
    for name in remove {
        if let Ok(name) = name.parse::<HeaderName>() {
            headers.remove(&name);
        }
    }
    for (name, value) in add {
        let parsed = name
            .parse::<HeaderName>()
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        match parsed {
            Some((name, value)) => {
                headers.insert(name, value);
            }
            None => warn!(header = %name, "Skipping invalid header in transform-headers"),
        }
    }
}

#[async_trait]
impl Policy for TransformHeadersPolicy {
    fn id(&self) -> &str {
        "transform-headers"
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        apply_headers(
            &mut ctx.request.headers,
            &self.config.request_add,
            &self.config.request_remove,
        );
        Ok(PolicyOutcome::Continue)
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        apply_headers(
            &mut ctx.response.headers,
            &self.config.response_add,
            &self.config.response_remove,
        );
        Ok(PolicyOutcome::Continue)
    }
}

pub struct TransformHeadersFactory;

impl PolicyFactory for TransformHeadersFactory {
    fn policy_type(&self) -> &'static str {
        "transform-headers"
    }

    fn build(&self, config: &serde_json::Value) -> GatewayResult<Box<dyn Policy>> {
        let config: TransformHeadersConfig = serde_json::from_value(config.clone())
            .map_err(|e| GatewayError::internal(format!("invalid transform-headers config: {e}")))?;
        Ok(Box::new(TransformHeadersPolicy { config }))
    }
}

// ============================================================================
// mock
// ============================================================================

#[derive(Debug, Deserialize)]
struct MockConfig {
    #[serde(default = "default_mock_status")]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: String,
}

fn default_mock_status() -> u16 {
    200
}

/// Answers the request itself, skipping the upstream call
pub struct MockPolicy {
    config: MockConfig,
}

#[async_trait]
impl Policy for MockPolicy {
    fn id(&self) -> &str {
        "mock"
    }

    async fn on_request(&self, _ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        let status = StatusCode::from_u16(self.config.status)
            .map_err(|_| GatewayError::internal("invalid mock status code"))?;
        let mut response = GatewayResponse::with_body(status, Bytes::from(self.config.body.clone()));
        apply_headers(&mut response.headers, &self.config.headers, &[]);
        Ok(PolicyOutcome::ShortCircuit(response))
    }
}

pub struct MockFactory;

impl PolicyFactory for MockFactory {
    fn policy_type(&self) -> &'static str {
        "mock"
    }

    fn build(&self, config: &serde_json::Value) -> GatewayResult<Box<dyn Policy>> {
        let config: MockConfig = serde_json::from_value(config.clone())
            .map_err(|e| GatewayError::internal(format!("invalid mock config: {e}")))?;
        Ok(Box::new(MockPolicy { config }))
    }
}

// ============================================================================
// rate-limit
// ============================================================================

#[derive(Debug, Deserialize)]
struct RateLimitPolicyConfig {
    limit: u64,
    #[serde(default = "default_window_secs")]
    window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

/// Charges the request against the (api, plan, consumer) quota.
///
/// The consumer identity comes from the `security.consumer` attribute set
/// by the authentication provider; keyless traffic is keyed by plan alone.
/// On the response phase the policy stamps the standard X-RateLimit-*
/// headers from the decision recorded during the request phase.
pub struct RateLimitPolicy {
    config: RateLimitPolicyConfig,
}

const ATTR_LIMIT: &str = "ratelimit.limit";
const ATTR_REMAINING: &str = "ratelimit.remaining";
const ATTR_RESET: &str = "ratelimit.reset";

#[async_trait]
impl Policy for RateLimitPolicy {
    fn id(&self) -> &str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        let Some(limiter) = ctx.component::<RateLimiter>() else {
            // Misconfiguration, not a client error: fail the request loudly
            // rather than silently waiving quotas.
            return Err(GatewayError::internal("rate limiter component not registered"));
        };

        let Some(plan) = ctx.plan().cloned() else {
            return Err(GatewayError::internal("rate-limit policy ran before plan selection"));
        };

        let key = RateLimitKey {
            api: ctx.api().id.clone(),
            plan,
            consumer: ctx.attribute_str("security.consumer").map(str::to_string),
        };

        let window = TimeWindow::new(self.config.window_secs);
        let decision = limiter.try_consume(&key, self.config.limit, window).await?;

        ctx.set_attribute(ATTR_LIMIT, serde_json::json!(self.config.limit));
        ctx.set_attribute(ATTR_REMAINING, serde_json::json!(decision.remaining));
        ctx.set_attribute(ATTR_RESET, serde_json::json!(decision.reset_at));

        if !decision.allowed {
            let now_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            return Err(GatewayError::RateLimitExceeded {
                limit: self.config.limit,
                window_secs: self.config.window_secs,
                retry_after_secs: decision.reset_at.saturating_sub(now_secs),
            });
        }
        Ok(PolicyOutcome::Continue)
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        let pairs = [
            (
                HeaderName::from_static("x-ratelimit-limit"),
                ctx.attribute(ATTR_LIMIT).cloned(),
            ),
            (
                HeaderName::from_static("x-ratelimit-remaining"),
                ctx.attribute(ATTR_REMAINING).cloned(),
            ),
            (
                HeaderName::from_static("x-ratelimit-reset"),
                ctx.attribute(ATTR_RESET).cloned(),
            ),
        ];
        for (name, value) in pairs {
            if let Some(value) = value {
                if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
                    ctx.response.headers.insert(name, value);
                }
            }
        }
        Ok(PolicyOutcome::Continue)
    }
}

pub struct RateLimitFactory;

impl PolicyFactory for RateLimitFactory {
    fn policy_type(&self) -> &'static str {
        "rate-limit"
    }

    fn build(&self, config: &serde_json::Value) -> GatewayResult<Box<dyn Policy>> {
        let config: RateLimitPolicyConfig = serde_json::from_value(config.clone())
            .map_err(|e| GatewayError::internal(format!("invalid rate-limit config: {e}")))?;
        Ok(Box::new(RateLimitPolicy { config }))
    }
}
