//! Per-request execution context.
//!
//! The [`ExecutionContext`] threads mutable request state through the
//! pipeline: request, response, the attribute bag policies communicate
//! through, a metrics record and the component provider. It lives for
//! exactly one request and is dropped on completion, error or cancellation;
//! it is never stored in process-wide state and never reused.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use portcullis_common::{ApiId, EndpointName, HttpMethod, PlanId, RequestId};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::definition::Api;

/// Inbound request as seen by the pipeline
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    /// Request path, including the API context path
    pub path: String,
    /// Raw query string, without the leading '?'
    pub query: Option<String>,
    /// Host the client addressed
    pub host: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client address as reported by the transport layer
    pub client_ip: String,
}

impl GatewayRequest {
    /// First value of a header, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a query parameter, if present
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.query.as_deref()?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then_some(v)
        })
    }
}

/// Response under construction, or as returned by the upstream
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

impl Default for GatewayResponse {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Type-keyed lookup for shared collaborators.
///
/// Policies and security providers obtain shared services (the rate limiter,
/// the upstream client, credential validators) through this provider rather
/// than through global state. Keyed by logical type, not by name.
#[derive(Default)]
pub struct ComponentProvider {
    components: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ComponentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component instance under its concrete type
    pub fn register<T: Any + Send + Sync>(&mut self, component: Arc<T>) {
        self.components.insert(TypeId::of::<T>(), component);
    }

    /// Look up a component by type
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|c| c.clone().downcast::<T>().ok())
    }
}

/// Metrics record closed when the request finishes
#[derive(Debug, Clone)]
pub struct RequestMetricsRecord {
    pub request_id: RequestId,
    pub api: Option<ApiId>,
    pub plan: Option<PlanId>,
    pub endpoint: Option<EndpointName>,
    pub status: Option<u16>,
    started_at: Instant,
}

impl RequestMetricsRecord {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            api: None,
            plan: None,
            endpoint: None,
            status: None,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Per-request state container threaded through the pipeline
pub struct ExecutionContext {
    pub request: GatewayRequest,
    pub response: GatewayResponse,
    /// Attributes set by one policy and read by a later one
    attributes: HashMap<String, serde_json::Value>,
    pub metrics: RequestMetricsRecord,
    /// Snapshot of the API definition this request is bound to
    api: Arc<Api>,
    /// Plan selected by the security chain
    plan: Option<PlanId>,
    components: Arc<ComponentProvider>,
    cancellation: CancellationToken,
    request_id: RequestId,
}

impl ExecutionContext {
    /// Create a fresh context bound to an API snapshot.
    ///
    /// Called by the reactor once per request, after API resolution.
    pub fn new(
        request: GatewayRequest,
        api: Arc<Api>,
        components: Arc<ComponentProvider>,
        cancellation: CancellationToken,
    ) -> Self {
        let request_id = RequestId::generate();
        let mut metrics = RequestMetricsRecord::new(request_id.clone());
        metrics.api = Some(api.id.clone());
        Self {
            request,
            response: GatewayResponse::default(),
            attributes: HashMap::new(),
            metrics,
            api,
            plan: None,
            components,
            cancellation,
            request_id,
        }
    }

    #[inline]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    #[inline]
    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    #[inline]
    pub fn plan(&self) -> Option<&PlanId> {
        self.plan.as_ref()
    }

    /// Record the plan selected by the security chain
    pub fn set_plan(&mut self, plan: PlanId) {
        self.metrics.plan = Some(plan.clone());
        self.plan = Some(plan);
    }

    /// Set an attribute for later pipeline stages
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Look up a shared component by type
    pub fn component<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.components.get::<T>()
    }

    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the client disconnected or the request timed out
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_common::HttpMethod;

    pub(crate) fn test_request(method: HttpMethod, path: &str) -> GatewayRequest {
        GatewayRequest {
            method,
            path: path.to_string(),
            query: None,
            host: "api.example.com".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    fn test_api() -> Arc<Api> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": "orders",
                "name": "Orders",
                "version": "1",
                "context_path": "/orders",
                "plans": [{"id": "free", "name": "Free", "security": "keyless"}],
                "endpoints": []
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_attribute_propagation() {
        let mut ctx = ExecutionContext::new(
            test_request(HttpMethod::GET, "/orders/1"),
            test_api(),
            Arc::new(ComponentProvider::new()),
            CancellationToken::new(),
        );

        assert!(ctx.attribute("security.consumer").is_none());
        ctx.set_attribute("security.consumer", serde_json::json!("acme"));
        assert_eq!(ctx.attribute_str("security.consumer"), Some("acme"));
    }

    #[test]
    fn test_component_provider_type_keyed() {
        struct RateStore;
        struct HttpClient;

        let mut provider = ComponentProvider::new();
        provider.register(Arc::new(RateStore));

        assert!(provider.get::<RateStore>().is_some());
        assert!(provider.get::<HttpClient>().is_none());
    }

    #[test]
    fn test_query_param() {
        let mut req = test_request(HttpMethod::GET, "/orders");
        req.query = Some("api-key=secret&page=2".to_string());
        assert_eq!(req.query_param("api-key"), Some("secret"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_plan_selection_recorded_in_metrics() {
        let mut ctx = ExecutionContext::new(
            test_request(HttpMethod::GET, "/orders"),
            test_api(),
            Arc::new(ComponentProvider::new()),
            CancellationToken::new(),
        );

        ctx.set_plan("free".into());
        assert_eq!(ctx.plan().unwrap().as_str(), "free");
        assert_eq!(ctx.metrics.plan.as_ref().unwrap().as_str(), "free");
    }
}
