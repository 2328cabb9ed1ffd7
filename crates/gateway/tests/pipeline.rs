//! End-to-end pipeline tests through the public crate surface.
//!
//! These drive the reactor exactly as a transport layer would: deploy a
//! definition, register components, hand requests in and assert on the
//! responses and on what the (fake) upstream observed.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use portcullis_common::{ApiId, GatewayResult, HealthState, HttpMethod, PlanId};
use portcullis_gateway::balancer::SelectedEndpoint;
use portcullis_gateway::policy::{
    ChunkAction, Policy, PolicyFactory, PolicyOutcome, PolicyRegistry, StreamingPolicy,
};
use portcullis_gateway::ratelimit::{InMemoryRateLimitStore, RateLimiter};
use portcullis_gateway::security::{ApiKeyService, ApiKeyValidator, SecurityProviderRegistry};
use portcullis_gateway::{
    Api, ApiRegistry, ComponentProvider, ExecutionContext, GatewayConfig, GatewayRequest,
    GatewayResponse, Reactor, UpstreamClient,
};
use std::sync::Arc;

/// Upstream double: answers 200 and records which endpoint served each call
/// and the request it saw
struct RecordingUpstream {
    served_by: Mutex<Vec<String>>,
    seen_headers: Mutex<Vec<HeaderMap>>,
    seen_bodies: Mutex<Vec<Bytes>>,
}

impl RecordingUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            served_by: Mutex::new(Vec::new()),
            seen_headers: Mutex::new(Vec::new()),
            seen_bodies: Mutex::new(Vec::new()),
        })
    }

    fn served_by(&self) -> Vec<String> {
        self.served_by.lock().clone()
    }
}

#[async_trait]
impl UpstreamClient for RecordingUpstream {
    async fn invoke(
        &self,
        endpoint: &SelectedEndpoint,
        request: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.served_by.lock().push(endpoint.name.to_string());
        self.seen_headers.lock().push(request.headers.clone());
        self.seen_bodies.lock().push(request.body.clone());
        Ok(GatewayResponse::with_body(StatusCode::OK, "ok"))
    }
}

/// Two tenants with static API keys
struct TenantKeys;

#[async_trait]
impl ApiKeyValidator for TenantKeys {
    async fn validate(
        &self,
        _api: &ApiId,
        _plan: &PlanId,
        key: &str,
    ) -> GatewayResult<Option<String>> {
        Ok(match key {
            "acme-key" => Some("acme".to_string()),
            "globex-key" => Some("globex".to_string()),
            _ => None,
        })
    }
}

fn orders_api() -> Api {
    serde_json::from_value(serde_json::json!({
        "id": "orders",
        "name": "Orders",
        "version": "1",
        "context_path": "/orders",
        "plans": [
            {"id": "free", "name": "Free", "security": "keyless"},
            {
                "id": "gold",
                "name": "Gold",
                "security": "api-key",
                "flows": [{
                    "name": "quota",
                    "pre": [
                        {"policy": "rate-limit", "config": {"limit": 2, "window_secs": 3600}},
                        {"policy": "transform-headers",
                         "config": {"request_add": {"x-plan": "gold"}}}
                    ]
                }]
            }
        ],
        "flows": [{
            "name": "branding",
            "post": [{"policy": "transform-headers",
                      "config": {"response_add": {"x-gateway": "portcullis"}}}]
        }],
        "endpoints": [
            {"name": "backend-1", "target": "http://backend-1:8080"},
            {"name": "backend-2", "target": "http://backend-2:8080"}
        ]
    }))
    .unwrap()
}

fn gateway(upstream: Arc<dyn UpstreamClient>) -> (Reactor, Arc<ApiRegistry>) {
    let registry = Arc::new(ApiRegistry::new(
        Arc::new(PolicyRegistry::with_builtins()),
        Arc::new(SecurityProviderRegistry::with_builtins()),
    ));
    registry.deploy(orders_api()).unwrap();

    let mut components = ComponentProvider::new();
    components.register(Arc::new(ApiKeyService::new(Box::new(TenantKeys))));
    components.register(Arc::new(RateLimiter::new(Box::new(
        InMemoryRateLimitStore::new(),
    ))));

    let reactor = Reactor::new(
        Arc::clone(&registry),
        Arc::new(components),
        upstream,
        GatewayConfig::default(),
    );
    (reactor, registry)
}

fn request(path: &str, api_key: Option<&str>) -> GatewayRequest {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        headers.insert("x-api-key", HeaderValue::from_str(key).unwrap());
    }
    GatewayRequest {
        method: HttpMethod::GET,
        path: path.to_string(),
        query: None,
        host: "api.example.com".to_string(),
        headers,
        body: Bytes::new(),
        client_ip: "203.0.113.9".to_string(),
    }
}

#[tokio::test]
async fn keyed_request_runs_plan_flow_and_reaches_upstream() {
    let upstream = RecordingUpstream::new();
    let (reactor, _) = gateway(upstream.clone());

    let response = reactor.handle(request("/orders/42", Some("acme-key"))).await;
    assert_eq!(response.status, StatusCode::OK);

    // api-scoped post flow stamped the response
    assert_eq!(
        response.headers.get("x-gateway").and_then(|v| v.to_str().ok()),
        Some("portcullis")
    );
    assert!(response.headers.contains_key("x-request-id"));
    // rate-limit policy stamped quota headers on the way out
    assert_eq!(
        response
            .headers
            .get("x-ratelimit-limit")
            .and_then(|v| v.to_str().ok()),
        Some("2")
    );

    // plan-scoped pre flow transformed the request the upstream saw
    let seen = upstream.seen_headers.lock();
    assert_eq!(
        seen[0].get("x-plan").and_then(|v| v.to_str().ok()),
        Some("gold")
    );
}

#[tokio::test]
async fn invalid_key_is_rejected_before_upstream() {
    let upstream = RecordingUpstream::new();
    let (reactor, _) = gateway(upstream.clone());

    let response = reactor.handle(request("/orders/42", Some("stolen-key"))).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let payload: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(payload["code"], "AUTHENTICATION_FAILED");
    assert!(upstream.served_by().is_empty());
}

#[tokio::test]
async fn keyless_traffic_skips_plan_quota() {
    let upstream = RecordingUpstream::new();
    let (reactor, _) = gateway(upstream.clone());

    // The gold plan caps at 2; keyless traffic is not subject to it
    for _ in 0..5 {
        let response = reactor.handle(request("/orders/42", None)).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(upstream.served_by().len(), 5);
}

#[tokio::test]
async fn quota_is_per_consumer() {
    let upstream = RecordingUpstream::new();
    let (reactor, _) = gateway(upstream.clone());

    for _ in 0..2 {
        let r = reactor.handle(request("/orders/1", Some("acme-key"))).await;
        assert_eq!(r.status, StatusCode::OK);
    }
    let over = reactor.handle(request("/orders/1", Some("acme-key"))).await;
    assert_eq!(over.status, StatusCode::TOO_MANY_REQUESTS);

    // a different consumer still has its full budget
    let other = reactor.handle(request("/orders/1", Some("globex-key"))).await;
    assert_eq!(other.status, StatusCode::OK);
}

#[tokio::test]
async fn round_robin_spreads_across_backends() {
    let upstream = RecordingUpstream::new();
    let (reactor, _) = gateway(upstream.clone());

    for _ in 0..4 {
        reactor.handle(request("/orders/42", None)).await;
    }
    let served = upstream.served_by();
    assert_eq!(served, vec!["backend-1", "backend-2", "backend-1", "backend-2"]);
}

#[tokio::test]
async fn down_endpoint_drains_and_rejoins() {
    let upstream = RecordingUpstream::new();
    let (reactor, registry) = gateway(upstream.clone());

    registry.set_endpoint_state(&"orders".into(), &"backend-1".into(), HealthState::Down);
    for _ in 0..3 {
        let response = reactor.handle(request("/orders/42", None)).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert!(upstream.served_by().iter().all(|name| name == "backend-2"));

    registry.set_endpoint_state(&"orders".into(), &"backend-1".into(), HealthState::Up);
    for _ in 0..4 {
        reactor.handle(request("/orders/42", None)).await;
    }
    assert!(upstream.served_by().iter().any(|name| name == "backend-1"));
}

struct UppercaseBodyPolicy;

#[async_trait]
impl Policy for UppercaseBodyPolicy {
    fn id(&self) -> &str {
        "uppercase-body"
    }

    fn as_streaming(&self) -> Option<&dyn StreamingPolicy> {
        Some(self)
    }
}

fn upper(chunk: Bytes) -> Bytes {
    Bytes::from(chunk.iter().map(|b| b.to_ascii_uppercase()).collect::<Vec<u8>>())
}

#[async_trait]
impl StreamingPolicy for UppercaseBodyPolicy {
    async fn on_request_chunk(
        &self,
        _ctx: &mut ExecutionContext,
        chunk: Bytes,
        _end_of_stream: bool,
    ) -> GatewayResult<ChunkAction> {
        Ok(ChunkAction::Emit(vec![upper(chunk)]))
    }

    async fn on_response_chunk(
        &self,
        _ctx: &mut ExecutionContext,
        chunk: Bytes,
        _end_of_stream: bool,
    ) -> GatewayResult<ChunkAction> {
        Ok(ChunkAction::Emit(vec![upper(chunk)]))
    }
}

struct UppercaseBodyFactory;

impl PolicyFactory for UppercaseBodyFactory {
    fn policy_type(&self) -> &'static str {
        "uppercase-body"
    }

    fn build(&self, _config: &serde_json::Value) -> GatewayResult<Box<dyn Policy>> {
        Ok(Box::new(UppercaseBodyPolicy))
    }
}

#[tokio::test]
async fn streaming_policy_rewrites_bodies_on_both_sides() {
    let upstream = RecordingUpstream::new();

    let mut policies = PolicyRegistry::with_builtins();
    policies.register(Arc::new(UppercaseBodyFactory));
    let registry = Arc::new(ApiRegistry::new(
        Arc::new(policies),
        Arc::new(SecurityProviderRegistry::with_builtins()),
    ));

    let api: Api = serde_json::from_value(serde_json::json!({
        "id": "echo",
        "name": "Echo",
        "version": "1",
        "context_path": "/echo",
        "plans": [{"id": "free", "name": "Free", "security": "keyless"}],
        "flows": [{"pre": [{"policy": "uppercase-body"}]}],
        "endpoints": [{"name": "backend-1", "target": "http://backend-1:8080"}]
    }))
    .unwrap();
    registry.deploy(api).unwrap();

    let reactor = Reactor::new(
        Arc::clone(&registry),
        Arc::new(ComponentProvider::new()),
        upstream.clone(),
        GatewayConfig::default(),
    );

    let mut req = request("/echo/msg", None);
    req.body = Bytes::from("hello");
    let response = reactor.handle(req).await;
    assert_eq!(response.status, StatusCode::OK);

    // the request body was rewritten before the upstream saw it
    assert_eq!(upstream.seen_bodies.lock()[0], Bytes::from("HELLO"));
    // the same policy instance rewrote the upstream's response body
    assert_eq!(response.body, Bytes::from("OK"));
}

#[tokio::test]
async fn undeployed_api_stops_routing() {
    let upstream = RecordingUpstream::new();
    let (reactor, registry) = gateway(upstream.clone());

    assert_eq!(
        reactor.handle(request("/orders/42", None)).await.status,
        StatusCode::OK
    );

    registry.undeploy(&"orders".into());
    let response = reactor.handle(request("/orders/42", None)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(upstream.served_by().len(), 1);
}
