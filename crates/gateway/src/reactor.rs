//! Request reactor: the per-request orchestrator.
//!
//! One invocation of [`Reactor::handle`] drives a request through the whole
//! pipeline: API resolution, security, flow resolution, the request policy
//! chain, upstream invocation with health-aware retry, and the response
//! policy chain. Every exit, success or failure, produces a complete
//! response carrying the request id; errors leave the process as a small
//! JSON payload built from the client-safe side of [`GatewayError`], never
//! as internal detail.
//!
//! The reactor owns nothing per-request beyond the [`ExecutionContext`]; all
//! shared state lives in the registry, the component provider and the
//! upstream client it was built with.
//!
//! Bodies buffered in memory are driven through the chains' chunk path as a
//! single terminal chunk; a transport with chunked transfer drives the same
//! path once per chunk.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderValue, StatusCode};
use portcullis_common::{GatewayError, GatewayMetrics, GatewayResult, RequestId};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::SelectedEndpoint;
use crate::config::GatewayConfig;
use crate::context::{ComponentProvider, ExecutionContext, GatewayRequest, GatewayResponse};
use crate::policy::chain::{ChainOutcome, Phase, PolicyChain};
use crate::registry::{ApiRegistry, DeployedApi};

/// Transport-level upstream invoker.
///
/// The reactor decides *which* endpoint to call and *whether* to retry; the
/// client only performs one exchange. Implementations map their transport
/// failures to [`GatewayError::UpstreamConnect`] and
/// [`GatewayError::UpstreamTimeout`] so the retry logic can tell retryable
/// failures from the rest.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &SelectedEndpoint,
        request: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse>;
}

/// The request-processing core
pub struct Reactor {
    registry: Arc<ApiRegistry>,
    components: Arc<ComponentProvider>,
    client: Arc<dyn UpstreamClient>,
    config: GatewayConfig,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Reactor {
    pub fn new(
        registry: Arc<ApiRegistry>,
        components: Arc<ComponentProvider>,
        client: Arc<dyn UpstreamClient>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            components,
            client,
            config,
            metrics: None,
        }
    }

    /// Attach the process-wide metrics collector
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one request to completion.
    ///
    /// Infallible by construction: every error becomes a response.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        if let Some(metrics) = &self.metrics {
            metrics.request_started();
        }

        let Some(deployed) = self.registry.lookup(&request.host, &request.path) else {
            let err = GatewayError::NoMatchingApi {
                host: request.host.clone(),
                path: request.path.clone(),
            };
            let request_id = RequestId::generate();
            debug!(request_id = %request_id, host = %request.host, path = %request.path, "Routing miss");
            if let Some(metrics) = &self.metrics {
                metrics.request_finished("unresolved", err.to_http_status(), 0.0);
            }
            return error_response(&err, &request_id);
        };

        let cancellation = CancellationToken::new();
        let mut ctx = ExecutionContext::new(
            request,
            Arc::clone(&deployed.api),
            Arc::clone(&self.components),
            cancellation.clone(),
        );
        let request_id = ctx.request_id().clone();

        let result = match timeout(
            self.config.request_timeout(),
            self.process(&mut ctx, &deployed),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // The pipeline future is dropped; cancel so anything it
                // spawned winds down too.
                cancellation.cancel();
                Err(GatewayError::UpstreamTimeout {
                    endpoint: deployed.api.id.to_string(),
                    duration_ms: self.config.request_timeout_ms,
                })
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    api = %deployed.api.id,
                    code = err.code(),
                    error = %err,
                    "Request failed"
                );
                error_response(&err, &request_id)
            }
        };
        stamp_request_id(&mut response, &request_id);

        ctx.metrics.status = Some(response.status.as_u16());
        info!(
            request_id = %request_id,
            api = %deployed.api.id,
            status = response.status.as_u16(),
            duration_ms = ctx.metrics.elapsed().as_millis() as u64,
            "Request completed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.request_finished(
                deployed.api.id.as_str(),
                response.status.as_u16(),
                ctx.metrics.elapsed().as_secs_f64(),
            );
            if response.status == StatusCode::TOO_MANY_REQUESTS {
                metrics.rate_limited(deployed.api.id.as_str());
            }
        }
        response
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        deployed: &DeployedApi,
    ) -> GatewayResult<GatewayResponse> {
        deployed.security.apply(ctx).await?;

        // Flow resolution happens after security so plan flows and
        // attribute conditions see the authenticated identity.
        let resolved = deployed.flows.resolve(ctx);

        let mut request_chain = PolicyChain::new(Phase::Request, resolved.instantiate_pre()?);
        let short_circuited = match request_chain.execute(ctx).await {
            ChainOutcome::Completed => false,
            ChainOutcome::Failed(failure) => {
                self.record_interruption(&failure.policy, "failure");
                return Err(GatewayError::policy(
                    failure.policy,
                    failure.status,
                    failure.message,
                ));
            }
            ChainOutcome::ShortCircuited(response) => {
                self.record_interruption("short-circuit", "short_circuit");
                ctx.response = response;
                true
            }
            ChainOutcome::Cancelled => {
                return Err(GatewayError::internal("request cancelled"));
            }
        };

        if !short_circuited {
            if request_chain.has_streaming() {
                let body = std::mem::take(&mut ctx.request.body);
                let chunks = request_chain.process_chunk(ctx, body, true).await?;
                ctx.request.body = concat_chunks(chunks);
            }
            ctx.response = self.invoke_upstream(ctx, deployed).await?;
        }

        // The response chain runs for upstream responses and short-circuits
        // alike; only failures skip it. Request-phase policies keep
        // participating with the same instances (quota headers, body
        // transforms), followed by the flow's response-phase policies.
        let mut response_policies = request_chain.into_policies();
        response_policies.extend(resolved.instantiate_post()?);
        let mut response_chain = PolicyChain::new(Phase::Response, response_policies);
        match response_chain.execute(ctx).await {
            ChainOutcome::Completed => {
                if response_chain.has_streaming() {
                    let body = std::mem::take(&mut ctx.response.body);
                    let chunks = response_chain.process_chunk(ctx, body, true).await?;
                    ctx.response.body = concat_chunks(chunks);
                }
                Ok(ctx.response.clone())
            }
            ChainOutcome::Failed(failure) => {
                self.record_interruption(&failure.policy, "failure");
                Err(GatewayError::policy(
                    failure.policy,
                    failure.status,
                    failure.message,
                ))
            }
            ChainOutcome::ShortCircuited(response) => Ok(response),
            ChainOutcome::Cancelled => Err(GatewayError::internal("request cancelled")),
        }
    }

    /// Invoke the upstream, cycling to another UP endpoint on retryable
    /// failures up to the API's retry budget
    async fn invoke_upstream(
        &self,
        ctx: &mut ExecutionContext,
        deployed: &DeployedApi,
    ) -> GatewayResult<GatewayResponse> {
        let attempts = deployed.proxy_retry_attempts(self.config.default_retry_attempts);
        let upstream_timeout =
            std::time::Duration::from_millis(deployed.api.proxy.upstream_timeout_ms);

        let mut last_err: Option<GatewayError> = None;
        for attempt in 1..=attempts {
            // Selection before any connection attempt: an empty UP subset
            // never reaches the client.
            let Some(endpoint) = deployed.balancer.next() else {
                return Err(GatewayError::NoUpstreamAvailable {
                    api: deployed.api.id.to_string(),
                });
            };

            if let Some(metrics) = &self.metrics {
                metrics.upstream_attempt(deployed.api.id.as_str());
            }
            debug!(
                request_id = %ctx.request_id(),
                endpoint = %endpoint.name,
                attempt,
                "Invoking upstream"
            );

            let outcome = match timeout(upstream_timeout, self.client.invoke(&endpoint, &ctx.request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::UpstreamTimeout {
                    endpoint: endpoint.name.to_string(),
                    duration_ms: deployed.api.proxy.upstream_timeout_ms,
                }),
            };

            match outcome {
                Ok(response) => {
                    ctx.metrics.endpoint = Some(endpoint.name.clone());
                    return Ok(response);
                }
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.upstream_failure(deployed.api.id.as_str());
                    }
                    warn!(
                        request_id = %ctx.request_id(),
                        endpoint = %endpoint.name,
                        attempt,
                        retryable = err.is_retryable(),
                        error = %err,
                        "Upstream attempt failed"
                    );
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        // Connect-level retry budget exhausted: to the client that is the
        // same as having no healthy endpoint at all. A timeout on the final
        // attempt keeps its own mapping.
        match last_err {
            Some(err @ GatewayError::UpstreamTimeout { .. }) => Err(err),
            Some(err) => {
                warn!(
                    request_id = %ctx.request_id(),
                    api = %deployed.api.id,
                    attempts,
                    error = %err,
                    "Retry budget exhausted"
                );
                Err(GatewayError::NoUpstreamAvailable {
                    api: deployed.api.id.to_string(),
                })
            }
            None => Err(GatewayError::NoUpstreamAvailable {
                api: deployed.api.id.to_string(),
            }),
        }
    }

    fn record_interruption(&self, policy: &str, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.policy_interrupted(policy, kind);
        }
    }
}

impl DeployedApi {
    fn proxy_retry_attempts(&self, default: u32) -> u32 {
        let configured = self.api.proxy.retry_attempts;
        if configured == 0 {
            default.max(1)
        } else {
            configured
        }
    }
}

/// Reassemble the chunks a streaming chain emitted for a buffered body
fn concat_chunks(chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.into_iter().next().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in &chunks {
        buf.extend_from_slice(chunk);
    }
    buf.freeze()
}

/// Client-safe JSON error payload
fn error_response(err: &GatewayError, request_id: &RequestId) -> GatewayResponse {
    let status = StatusCode::from_u16(err.to_http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "code": err.code(),
        "message": err.client_message(),
        "request_id": request_id.to_string(),
    });

    let mut response = GatewayResponse::with_body(status, body.to_string());
    response.headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let GatewayError::RateLimitExceeded {
        retry_after_secs, ..
    } = err
    {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers.insert(http::header::RETRY_AFTER, value);
        }
    }
    response
}

fn stamp_request_id(response: &mut GatewayResponse, request_id: &RequestId) {
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers.insert("x-request-id", value);
    }
}
