//! Deployed-API registry and routing.
//!
//! Deployment is where all per-API compilation happens: flow conditions,
//! policy factory resolution, the security chain and the endpoint pool are
//! built once here, so the per-request path never touches a factory table
//! or a regex compiler. A definition that fails compilation is rejected at
//! deploy time and never serves traffic.
//!
//! Lookup routes by virtual host and context path, longest context path
//! first, matching on path-segment boundaries only.

use dashmap::DashMap;
use portcullis_common::{ApiId, EndpointName, GatewayError, GatewayResult, HealthState};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::balancer::{create_balancer, EndpointPool, LoadBalancer};
use crate::definition::Api;
use crate::flow::FlowResolver;
use crate::policy::PolicyRegistry;
use crate::security::{SecurityChain, SecurityProviderRegistry};

/// Registry change notifications, for health checkers and admin surfaces
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    ApiDeployed(ApiId),
    ApiUndeployed(ApiId),
}

/// An API with everything the request path needs, compiled at deploy time
pub struct DeployedApi {
    pub api: Arc<Api>,
    pub flows: FlowResolver,
    pub security: SecurityChain,
    pub pool: Arc<EndpointPool>,
    pub balancer: Arc<dyn LoadBalancer>,
}

/// Concurrent registry of deployed APIs.
///
/// Deploy and undeploy run on the control plane while lookups run on every
/// request; the map is sharded and lookups clone an `Arc` snapshot, so a
/// redeploy never affects a request already in flight.
pub struct ApiRegistry {
    apis: DashMap<ApiId, Arc<DeployedApi>>,
    policies: Arc<PolicyRegistry>,
    security_providers: Arc<SecurityProviderRegistry>,
    events: broadcast::Sender<GatewayEvent>,
}

impl ApiRegistry {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        security_providers: Arc<SecurityProviderRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            apis: DashMap::new(),
            policies,
            security_providers,
            events,
        }
    }

    /// Subscribe to deploy/undeploy notifications
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Compile and publish an API definition.
    ///
    /// Redeploying an existing id atomically replaces the previous version;
    /// in-flight requests keep the snapshot they started with.
    pub fn deploy(&self, api: Api) -> GatewayResult<()> {
        validate(&api)?;

        let flows = FlowResolver::compile(&api, &self.policies)?;
        let security = SecurityChain::build(&api, &self.security_providers);
        let pool = Arc::new(EndpointPool::new(&api.endpoints));
        let balancer = create_balancer(api.proxy.load_balancer, Arc::clone(&pool));

        let id = api.id.clone();
        let deployed = Arc::new(DeployedApi {
            api: Arc::new(api),
            flows,
            security,
            pool,
            balancer,
        });

        let replaced = self.apis.insert(id.clone(), deployed).is_some();
        info!(api = %id, replaced, "API deployed");

        // Nobody listening is fine
        let _ = self.events.send(GatewayEvent::ApiDeployed(id));
        Ok(())
    }

    /// Remove an API from routing. Unknown ids are a no-op.
    pub fn undeploy(&self, id: &ApiId) {
        if self.apis.remove(id).is_some() {
            info!(api = %id, "API undeployed");
            let _ = self.events.send(GatewayEvent::ApiUndeployed(id.clone()));
        } else {
            warn!(api = %id, "Undeploy of unknown API ignored");
        }
    }

    /// Route a request to a deployed API.
    ///
    /// Among APIs whose host restriction and context path both match, the
    /// longest context path wins, so `/orders/admin` shadows `/orders`.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<DeployedApi>> {
        self.apis
            .iter()
            .filter(|entry| {
                let api = &entry.value().api;
                host_matches(api.host.as_deref(), host)
                    && context_path_matches(&api.context_path, path)
            })
            .max_by_key(|entry| entry.value().api.context_path.len())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of a deployed API by id
    pub fn get(&self, id: &ApiId) -> Option<Arc<DeployedApi>> {
        self.apis.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of all deployed APIs
    pub fn api_ids(&self) -> Vec<ApiId> {
        self.apis.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Health-checker entry point: flip an endpoint's state
    pub fn set_endpoint_state(&self, api: &ApiId, endpoint: &EndpointName, state: HealthState) {
        match self.get(api) {
            Some(deployed) => deployed.pool.set_state(endpoint, state),
            None => warn!(api = %api, "Health report for unknown API ignored"),
        }
    }
}

fn validate(api: &Api) -> GatewayResult<()> {
    if !api.context_path.starts_with('/') {
        return Err(GatewayError::internal(format!(
            "API '{}': context path must start with '/'",
            api.id
        )));
    }
    if api.plans.is_empty() {
        return Err(GatewayError::internal(format!(
            "API '{}': at least one plan is required",
            api.id
        )));
    }
    Ok(())
}

fn host_matches(restriction: Option<&str>, host: &str) -> bool {
    match restriction {
        Some(required) => required.eq_ignore_ascii_case(host),
        None => true,
    }
}

/// Prefix match on path-segment boundaries: "/orders" matches "/orders" and
/// "/orders/42" but not "/ordersx"
fn context_path_matches(context_path: &str, path: &str) -> bool {
    if context_path == "/" {
        return true;
    }
    match path.strip_prefix(context_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ApiRegistry {
        ApiRegistry::new(
            Arc::new(PolicyRegistry::with_builtins()),
            Arc::new(SecurityProviderRegistry::with_builtins()),
        )
    }

    fn api(id: &str, context_path: &str, host: Option<&str>) -> Api {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": id,
            "version": "1",
            "context_path": context_path,
            "host": host,
            "plans": [{"id": "free", "name": "Free", "security": "keyless"}],
            "endpoints": [{"name": "backend-1", "target": "http://backend-1:8080"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_deploy_and_lookup() {
        let registry = registry();
        registry.deploy(api("orders", "/orders", None)).unwrap();

        let hit = registry.lookup("api.example.com", "/orders/42").unwrap();
        assert_eq!(hit.api.id.as_str(), "orders");

        assert!(registry.lookup("api.example.com", "/payments").is_none());
        assert!(registry.lookup("api.example.com", "/ordersx").is_none());
    }

    #[test]
    fn test_longest_context_path_wins() {
        let registry = registry();
        registry.deploy(api("orders", "/orders", None)).unwrap();
        registry.deploy(api("orders-admin", "/orders/admin", None)).unwrap();

        let hit = registry.lookup("any", "/orders/admin/users").unwrap();
        assert_eq!(hit.api.id.as_str(), "orders-admin");

        let hit = registry.lookup("any", "/orders/42").unwrap();
        assert_eq!(hit.api.id.as_str(), "orders");
    }

    #[test]
    fn test_host_restriction() {
        let registry = registry();
        registry
            .deploy(api("internal", "/v1", Some("internal.example.com")))
            .unwrap();

        assert!(registry.lookup("internal.example.com", "/v1/x").is_some());
        assert!(registry.lookup("INTERNAL.example.com", "/v1/x").is_some());
        assert!(registry.lookup("public.example.com", "/v1/x").is_none());
    }

    #[test]
    fn test_redeploy_replaces() {
        let registry = registry();
        registry.deploy(api("orders", "/orders", None)).unwrap();

        let mut v2 = api("orders", "/orders", None);
        v2.version = "2".to_string();
        registry.deploy(v2).unwrap();

        let hit = registry.lookup("any", "/orders").unwrap();
        assert_eq!(hit.api.version, "2");
        assert_eq!(registry.api_ids().len(), 1);
    }

    #[test]
    fn test_undeploy_removes_from_routing() {
        let registry = registry();
        registry.deploy(api("orders", "/orders", None)).unwrap();
        registry.undeploy(&"orders".into());
        assert!(registry.lookup("any", "/orders").is_none());
    }

    #[test]
    fn test_invalid_definition_rejected() {
        let registry = registry();

        let mut bad_path = api("a", "/a", None);
        bad_path.context_path = "no-slash".to_string();
        assert!(registry.deploy(bad_path).is_err());

        let mut no_plans = api("b", "/b", None);
        no_plans.plans.clear();
        assert!(registry.deploy(no_plans).is_err());

        let broken_flow: Api = serde_json::from_value(serde_json::json!({
            "id": "c",
            "name": "c",
            "version": "1",
            "context_path": "/c",
            "plans": [{"id": "free", "name": "Free", "security": "keyless"}],
            "flows": [{"pre": [{"policy": "no-such-policy"}]}],
            "endpoints": []
        }))
        .unwrap();
        assert!(registry.deploy(broken_flow).is_err());
        assert!(registry.lookup("any", "/c").is_none());
    }

    #[test]
    fn test_deploy_events() {
        let registry = registry();
        let mut events = registry.subscribe();

        registry.deploy(api("orders", "/orders", None)).unwrap();
        registry.undeploy(&"orders".into());

        assert!(matches!(events.try_recv().unwrap(), GatewayEvent::ApiDeployed(id) if id.as_str() == "orders"));
        assert!(matches!(events.try_recv().unwrap(), GatewayEvent::ApiUndeployed(id) if id.as_str() == "orders"));
    }

    #[test]
    fn test_endpoint_state_reaches_pool() {
        let registry = registry();
        registry.deploy(api("orders", "/orders", None)).unwrap();

        registry.set_endpoint_state(&"orders".into(), &"backend-1".into(), HealthState::Down);
        let deployed = registry.get(&"orders".into()).unwrap();
        assert!(deployed.pool.up_endpoints().is_empty());

        // unknown API must not panic
        registry.set_endpoint_state(&"ghost".into(), &"backend-1".into(), HealthState::Down);
    }
}
