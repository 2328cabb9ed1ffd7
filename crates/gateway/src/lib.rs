//! Portcullis Gateway Core
//!
//! The request-processing core of the Portcullis API gateway: for every
//! inbound call it resolves the target API, authenticates the request,
//! executes an ordered chain of cross-cutting policies, picks a healthy
//! upstream endpoint and proxies the call, all while enforcing per-consumer
//! rate limits.
//!
//! The pipeline driven by [`reactor::Reactor`] is:
//!
//! 1. API resolution against the [`registry::ApiRegistry`]
//! 2. Authentication via the [`security::SecurityChain`]
//! 3. Flow resolution ([`flow::FlowResolver`]) and the request-phase
//!    [`policy::chain::PolicyChain`]
//! 4. Endpoint selection ([`balancer`]) and the proxied upstream call
//! 5. The response-phase policy chain and final response emission
//!
//! Management APIs, persistence, control-plane synchronization and transport
//! concerns live outside this crate; they interact with the core through the
//! registry, the component provider and the health-state mutation point.

pub mod balancer;
pub mod config;
pub mod context;
pub mod definition;
pub mod flow;
pub mod policy;
pub mod ratelimit;
pub mod reactor;
pub mod registry;
pub mod security;

pub use config::GatewayConfig;
pub use context::{ComponentProvider, ExecutionContext, GatewayRequest, GatewayResponse};
pub use definition::{Api, Endpoint, Flow, Plan, PolicyRef, ProxyConfig};
pub use reactor::{Reactor, UpstreamClient};
pub use registry::{ApiRegistry, GatewayEvent};
