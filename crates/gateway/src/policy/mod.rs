//! Policy abstraction and the factory registry.
//!
//! A policy is a unit of cross-cutting logic bound to the request phase,
//! the response phase or both. Policies are instantiated per request (one
//! instance per request-policy pair) from factories resolved once at
//! API-load time, and communicate through the execution context's
//! attribute bag.

pub mod builtin;
pub mod chain;

use async_trait::async_trait;
use bytes::Bytes;
use portcullis_common::GatewayResult;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::context::{ExecutionContext, GatewayResponse};

/// Three-way result of a policy step.
///
/// Short-circuiting is an ordinary value, not an error: a policy that
/// answers from a cache or a mock interrupts the chain *successfully*,
/// which the reactor reports differently from a failure.
#[derive(Debug)]
pub enum PolicyOutcome {
    /// Fall through to the next policy in the chain
    Continue,
    /// Interrupt the chain with a structured failure
    Failure(PolicyFailure),
    /// Interrupt the chain with a complete successful response
    ShortCircuit(GatewayResponse),
}

/// Structured failure payload carried out of an interrupted chain
#[derive(Debug, Clone)]
pub struct PolicyFailure {
    /// Policy that raised the failure, for diagnosis
    pub policy: String,
    pub status: u16,
    pub message: String,
    pub cause: Option<String>,
}

impl PolicyFailure {
    pub fn new(policy: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            status,
            message: message.into(),
            cause: None,
        }
    }
}

/// What a streaming policy does with a body chunk
#[derive(Debug)]
pub enum ChunkAction {
    /// Emit these chunks downstream (possibly rewritten or injected)
    Emit(Vec<Bytes>),
    /// Buffer; nothing flows downstream until a later Emit
    Hold,
}

/// A unit of cross-cutting logic executed against one request.
///
/// Instances never outlive the request they were built for; shared state
/// belongs in components reached through the execution context.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Policy type identifier, used in logs and failure payloads
    fn id(&self) -> &str;

    /// Request-phase step
    async fn on_request(&self, _ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        Ok(PolicyOutcome::Continue)
    }

    /// Response-phase step
    async fn on_response(&self, _ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        Ok(PolicyOutcome::Continue)
    }

    /// Streaming capability, for policies that transform body chunks
    fn as_streaming(&self) -> Option<&dyn StreamingPolicy> {
        None
    }
}

/// Chunk-wise body transform.
///
/// Driven pull-based by the chain: a chunk is only requested when the
/// downstream consumer is ready for more, so a slow consumer suspends
/// upstream production. A policy may rewrite the chunk, hold it for
/// buffering, or inject additional chunks.
#[async_trait]
pub trait StreamingPolicy: Send + Sync {
    async fn on_request_chunk(
        &self,
        ctx: &mut ExecutionContext,
        chunk: Bytes,
        end_of_stream: bool,
    ) -> GatewayResult<ChunkAction>;

    async fn on_response_chunk(
        &self,
        ctx: &mut ExecutionContext,
        chunk: Bytes,
        end_of_stream: bool,
    ) -> GatewayResult<ChunkAction>;
}

/// Builds per-request policy instances from a configuration blob
pub trait PolicyFactory: Send + Sync {
    /// Type string this factory is registered under
    fn policy_type(&self) -> &'static str;

    /// Build one instance for one request-policy pair
    fn build(&self, config: &serde_json::Value) -> GatewayResult<Box<dyn Policy>>;
}

/// Factory registry keyed by declared policy type string.
///
/// Looked up once per policy reference at API deployment, never per request.
#[derive(Default)]
pub struct PolicyRegistry {
    factories: HashMap<&'static str, Arc<dyn PolicyFactory>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in policies
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::TransformHeadersFactory));
        registry.register(Arc::new(builtin::MockFactory));
        registry.register(Arc::new(builtin::RateLimitFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn PolicyFactory>) {
        debug!(policy_type = factory.policy_type(), "Policy factory registered");
        self.factories.insert(factory.policy_type(), factory);
    }

    pub fn get(&self, policy_type: &str) -> Option<Arc<dyn PolicyFactory>> {
        self.factories.get(policy_type).cloned()
    }
}
