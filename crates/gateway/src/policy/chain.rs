//! Policy chain execution engine.
//!
//! An ephemeral per-request sequence of policies driven strictly in order.
//! A policy either completes (implicitly advancing to the next), fails with
//! a structured payload, or short-circuits with a complete response; the
//! latter two interrupt the chain and skip everything behind it. An
//! error propagated out of a policy is treated exactly like an explicit
//! failure, rendered through its client-safe payload and logged with the
//! originating policy id.

use bytes::Bytes;
use portcullis_common::GatewayResult;
use tracing::{debug, error, trace};

use super::{ChunkAction, Policy, PolicyFailure, PolicyOutcome};
use crate::context::{ExecutionContext, GatewayResponse};

/// Which half of the pipeline the chain is running in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

/// Chain lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Pending,
    Running,
    Completed,
    Interrupted,
}

/// Terminal result of a chain run, consumed by the reactor
#[derive(Debug)]
pub enum ChainOutcome {
    /// Every policy fell through
    Completed,
    /// A policy failed (explicitly or by fault); downstream stages skip
    Failed(PolicyFailure),
    /// A policy produced the final response itself (e.g. mock, cache hit)
    ShortCircuited(GatewayResponse),
    /// Cancellation observed between policies; the request is being torn down
    Cancelled,
}

/// Ordered per-request policy chain
pub struct PolicyChain {
    policies: Vec<Box<dyn Policy>>,
    phase: Phase,
    state: ChainState,
}

impl PolicyChain {
    pub fn new(phase: Phase, policies: Vec<Box<dyn Policy>>) -> Self {
        Self {
            policies,
            phase,
            state: ChainState::Pending,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Whether any policy in the chain transforms body chunks
    pub fn has_streaming(&self) -> bool {
        self.policies.iter().any(|p| p.as_streaming().is_some())
    }

    /// Hand the instances over, e.g. to carry request-phase policies into
    /// the response-phase chain
    pub fn into_policies(self) -> Vec<Box<dyn Policy>> {
        self.policies
    }

    /// Run the chain to completion or interruption.
    ///
    /// Policies execute strictly sequentially; the chain waits for each
    /// step before invoking the next, while unrelated requests progress on
    /// other tasks.
    pub async fn execute(&mut self, ctx: &mut ExecutionContext) -> ChainOutcome {
        self.state = ChainState::Running;

        for policy in &self.policies {
            // Cooperative cancellation: observed between policies, not
            // mid-policy.
            if ctx.is_cancelled() {
                debug!(
                    request_id = %ctx.request_id(),
                    phase = ?self.phase,
                    "Chain aborted by cancellation"
                );
                self.state = ChainState::Interrupted;
                return ChainOutcome::Cancelled;
            }

            trace!(
                request_id = %ctx.request_id(),
                policy = policy.id(),
                phase = ?self.phase,
                "Executing policy"
            );

            let step = match self.phase {
                Phase::Request => policy.on_request(ctx).await,
                Phase::Response => policy.on_response(ctx).await,
            };

            match step {
                Ok(PolicyOutcome::Continue) => continue,
                Ok(PolicyOutcome::Failure(failure)) => {
                    debug!(
                        request_id = %ctx.request_id(),
                        policy = %failure.policy,
                        status = failure.status,
                        message = %failure.message,
                        "Policy chain interrupted by failure"
                    );
                    self.state = ChainState::Interrupted;
                    return ChainOutcome::Failed(failure);
                }
                Ok(PolicyOutcome::ShortCircuit(response)) => {
                    debug!(
                        request_id = %ctx.request_id(),
                        policy = policy.id(),
                        status = %response.status,
                        "Policy chain short-circuited"
                    );
                    self.state = ChainState::Interrupted;
                    return ChainOutcome::ShortCircuited(response);
                }
                Err(err) => {
                    // Propagated error: same interruption semantics as an
                    // explicit failure, rendered through the error's
                    // client-safe side.
                    let status = err.to_http_status();
                    if status >= 500 {
                        error!(
                            request_id = %ctx.request_id(),
                            policy = policy.id(),
                            error = %err,
                            "Uncaught policy fault"
                        );
                    } else {
                        debug!(
                            request_id = %ctx.request_id(),
                            policy = policy.id(),
                            status,
                            error = %err,
                            "Policy rejected request"
                        );
                    }
                    self.state = ChainState::Interrupted;
                    return ChainOutcome::Failed(PolicyFailure {
                        policy: policy.id().to_string(),
                        status,
                        message: err.client_message(),
                        cause: Some(err.to_string()),
                    });
                }
            }
        }

        self.state = ChainState::Completed;
        ChainOutcome::Completed
    }

    /// Pipe one body chunk through the chain's streaming-capable policies.
    ///
    /// Called once per chunk by whoever drives the body (pull-based, so
    /// backpressure propagates: no new chunk is processed until the caller
    /// asks for one). Policies that hold a chunk swallow it; injected
    /// chunks from one policy flow through the remaining ones in order.
    pub async fn process_chunk(
        &self,
        ctx: &mut ExecutionContext,
        chunk: Bytes,
        end_of_stream: bool,
    ) -> GatewayResult<Vec<Bytes>> {
        let mut in_flight = vec![chunk];

        for policy in &self.policies {
            let Some(streaming) = policy.as_streaming() else {
                continue;
            };

            let mut produced = Vec::new();
            let count = in_flight.len();
            for (index, piece) in in_flight.into_iter().enumerate() {
                let last = end_of_stream && index + 1 == count;
                let action = match self.phase {
                    Phase::Request => streaming.on_request_chunk(ctx, piece, last).await?,
                    Phase::Response => streaming.on_response_chunk(ctx, piece, last).await?,
                };
                match action {
                    ChunkAction::Emit(chunks) => produced.extend(chunks),
                    ChunkAction::Hold => {}
                }
            }
            in_flight = produced;
            if in_flight.is_empty() && !end_of_stream {
                // Everything buffered; nothing to hand downstream yet.
                break;
            }
        }

        Ok(in_flight)
    }
}
