//! API definition model.
//!
//! These types describe a published API: its plans, flows, endpoints and
//! proxy configuration. Definitions are immutable after publication; the
//! core holds an `Arc<Api>` snapshot for the lifetime of one request, so a
//! control-plane update never affects an in-flight call.

use portcullis_common::{ApiId, EndpointName, LbAlgorithm, PlanId, PolicyId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A published, routable backend definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub id: ApiId,
    pub name: String,
    pub version: String,
    /// Context path the API is mounted on ("/orders")
    pub context_path: String,
    /// Optional virtual host restriction; empty matches any host
    #[serde(default)]
    pub host: Option<String>,
    /// Consumer-facing plans; exactly one is selected per request
    pub plans: Vec<Plan>,
    /// API-scoped flows, evaluated before plan-scoped flows
    #[serde(default)]
    pub flows: Vec<Flow>,
    /// Upstream endpoints backing this API
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Api {
    /// Find a plan by id
    pub fn plan(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.iter().find(|p| &p.id == id)
    }
}

/// A consumer-facing contract (security + subscription tier) attached to an API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Security type string resolved against the security provider registry
    /// ("api-key", "bearer", "keyless")
    pub security: String,
    /// Provider-specific security configuration
    #[serde(default)]
    pub security_config: serde_json::Value,
    /// Plan-scoped flows, evaluated after API-scoped flows
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// A condition-matched bundle of request/response policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: FlowCondition,
    /// Request-phase policies, in execution order
    #[serde(default)]
    pub pre: Vec<PolicyRef>,
    /// Response-phase policies, in execution order
    #[serde(default)]
    pub post: Vec<PolicyRef>,
}

/// Matching condition of a flow; all declared parts must hold
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowCondition {
    /// Path to match, interpreted according to `path_operator`
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_operator: PathOperator,
    /// HTTP methods the flow applies to; empty means all methods
    #[serde(default)]
    pub methods: Vec<String>,
    /// Context-attribute equality predicates, all of which must hold
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// How the flow path condition is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathOperator {
    #[default]
    StartsWith,
    Equals,
    Regex,
}

/// Reference to a policy type plus its configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRef {
    /// Policy type resolved against the policy factory registry
    pub policy: PolicyId,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Disabled policies are kept in the definition but never executed
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl PolicyRef {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// One upstream target instance backing an API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: EndpointName,
    /// Target URI ("http://backend-1:8080")
    pub target: String,
    /// Weight for weighted balancing strategies
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Proxying behavior for an API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub load_balancer: LbAlgorithm,
    /// How many endpoints to try on retryable upstream failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Per-request upstream timeout in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            load_balancer: LbAlgorithm::default(),
            retry_attempts: default_retry_attempts(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_deserializes_with_defaults() {
        let api: Api = serde_json::from_value(serde_json::json!({
            "id": "orders",
            "name": "Orders API",
            "version": "1.0",
            "context_path": "/orders",
            "plans": [{
                "id": "free",
                "name": "Free",
                "security": "keyless"
            }],
            "endpoints": [{
                "name": "backend-1",
                "target": "http://backend-1:8080"
            }]
        }))
        .unwrap();

        assert_eq!(api.id.as_str(), "orders");
        assert!(api.flows.is_empty());
        assert_eq!(api.endpoints[0].weight, 1);
        assert_eq!(api.proxy.retry_attempts, 1);
        assert!(api.plans[0].flows.is_empty());
    }

    #[test]
    fn test_policy_ref_enabled_default() {
        let policy: PolicyRef = serde_json::from_value(serde_json::json!({
            "policy": "transform-headers"
        }))
        .unwrap();
        assert!(policy.is_enabled());

        let disabled: PolicyRef = serde_json::from_value(serde_json::json!({
            "policy": "transform-headers",
            "enabled": false
        }))
        .unwrap();
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn test_plan_lookup() {
        let api: Api = serde_json::from_value(serde_json::json!({
            "id": "a",
            "name": "a",
            "version": "1",
            "context_path": "/a",
            "plans": [
                {"id": "gold", "name": "Gold", "security": "api-key"},
                {"id": "free", "name": "Free", "security": "keyless"}
            ],
            "endpoints": []
        }))
        .unwrap();

        assert!(api.plan(&"gold".into()).is_some());
        assert!(api.plan(&"platinum".into()).is_none());
    }
}
