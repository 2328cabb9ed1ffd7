//! Common utilities and shared components for the Portcullis gateway
//!
//! This crate provides shared functionality used across the Portcullis
//! pipeline: the error taxonomy, type-safe identifiers, common value types
//! and observability bootstrap (tracing + metrics).
//!
//! # Module Organization
//!
//! - [`ids`]: Type-safe identifier newtypes (ApiId, PlanId, RequestId, ...)
//! - [`types`]: Common type definitions (HealthState, TimeWindow, ...)
//! - [`errors`]: Error taxonomy and result alias
//! - [`observability`]: Tracing bootstrap and gateway metrics

pub mod errors;
pub mod ids;
pub mod observability;
pub mod types;

pub use errors::{GatewayError, GatewayResult};
pub use ids::{ApiId, EndpointName, PlanId, PolicyId, RequestId};
pub use observability::{init_tracing, GatewayMetrics};
pub use types::{HealthState, HttpMethod, LbAlgorithm, TimeWindow};
