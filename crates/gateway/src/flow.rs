//! Flow resolution.
//!
//! Flows are compiled once at API deployment (regex compilation, method set
//! parsing, policy factory lookup) and matched per request. All matching
//! flows contribute their policies, concatenated in declaration order:
//! API-scoped flows first, then flows of the selected plan. The
//! response-phase list is computed from the same matched-flow set as the
//! request-phase list, so both phases of one call always see the same
//! flows. An empty match is a valid result, not an error.

use portcullis_common::{GatewayError, GatewayResult, HttpMethod, PlanId, PolicyId};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::definition::{Api, Flow, FlowCondition, PathOperator, PolicyRef};
use crate::policy::{Policy, PolicyFactory, PolicyRegistry};

/// A policy reference with its factory resolved at deployment
pub struct CompiledPolicyRef {
    policy_type: PolicyId,
    factory: Arc<dyn PolicyFactory>,
    config: serde_json::Value,
}

impl CompiledPolicyRef {
    /// Build one policy instance for one request
    pub fn instantiate(&self) -> GatewayResult<Box<dyn Policy>> {
        self.factory.build(&self.config)
    }

    pub fn policy_type(&self) -> &str {
        self.policy_type.as_str()
    }
}

/// A flow with its condition pre-processed for cheap per-request matching
pub struct CompiledFlow {
    name: Option<String>,
    matcher: CompiledCondition,
    pre: Vec<Arc<CompiledPolicyRef>>,
    post: Vec<Arc<CompiledPolicyRef>>,
}

struct CompiledCondition {
    path: Option<PathMatcher>,
    /// Empty set means all methods
    methods: HashSet<HttpMethod>,
    attributes: Vec<(String, serde_json::Value)>,
}

enum PathMatcher {
    StartsWith(String),
    Equals(String),
    Regex(Regex),
}

impl CompiledFlow {
    fn compile(flow: &Flow, policies: &PolicyRegistry) -> GatewayResult<Self> {
        Ok(Self {
            name: flow.name.clone(),
            matcher: CompiledCondition::compile(&flow.condition)?,
            pre: compile_policy_refs(&flow.pre, policies)?,
            post: compile_policy_refs(&flow.post, policies)?,
        })
    }

    /// Whether all declared conditions hold for this request
    fn matches(&self, ctx: &ExecutionContext, sub_path: &str) -> bool {
        let condition = &self.matcher;

        if let Some(path) = &condition.path {
            let hit = match path {
                PathMatcher::StartsWith(prefix) => sub_path.starts_with(prefix),
                PathMatcher::Equals(exact) => sub_path == exact,
                PathMatcher::Regex(regex) => regex.is_match(sub_path),
            };
            if !hit {
                return false;
            }
        }

        if !condition.methods.is_empty() && !condition.methods.contains(&ctx.request.method) {
            return false;
        }

        condition
            .attributes
            .iter()
            .all(|(key, expected)| ctx.attribute(key) == Some(expected))
    }
}

impl CompiledCondition {
    fn compile(condition: &FlowCondition) -> GatewayResult<Self> {
        let path = match (&condition.path, condition.path_operator) {
            (None, _) => None,
            (Some(p), PathOperator::StartsWith) => Some(PathMatcher::StartsWith(p.clone())),
            (Some(p), PathOperator::Equals) => Some(PathMatcher::Equals(p.clone())),
            (Some(p), PathOperator::Regex) => Some(PathMatcher::Regex(Regex::new(p).map_err(
                |e| GatewayError::internal(format!("invalid flow path regex '{p}': {e}")),
            )?)),
        };

        let methods = condition
            .methods
            .iter()
            .filter_map(|m| HttpMethod::from_str(m).ok())
            .collect();

        Ok(Self {
            path,
            methods,
            attributes: condition
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

fn compile_policy_refs(
    refs: &[PolicyRef],
    policies: &PolicyRegistry,
) -> GatewayResult<Vec<Arc<CompiledPolicyRef>>> {
    refs.iter()
        .filter(|r| r.is_enabled())
        .map(|r| {
            let factory = policies.get(r.policy.as_str()).ok_or_else(|| {
                GatewayError::internal(format!("unknown policy type '{}'", r.policy))
            })?;
            Ok(Arc::new(CompiledPolicyRef {
                policy_type: r.policy.clone(),
                factory,
                config: r.config.clone(),
            }))
        })
        .collect()
}

/// Ordered policy plans for both phases of one call
#[derive(Default)]
pub struct ResolvedFlows {
    pub pre: Vec<Arc<CompiledPolicyRef>>,
    pub post: Vec<Arc<CompiledPolicyRef>>,
}

impl ResolvedFlows {
    /// Instantiate the request-phase policies, one instance per pair
    pub fn instantiate_pre(&self) -> GatewayResult<Vec<Box<dyn Policy>>> {
        self.pre.iter().map(|p| p.instantiate()).collect()
    }

    /// Instantiate the response-phase policies
    pub fn instantiate_post(&self) -> GatewayResult<Vec<Box<dyn Policy>>> {
        self.post.iter().map(|p| p.instantiate()).collect()
    }
}

/// Per-API flow matcher, built once at deployment
pub struct FlowResolver {
    api_flows: Vec<CompiledFlow>,
    plan_flows: HashMap<PlanId, Vec<CompiledFlow>>,
}

impl FlowResolver {
    /// Compile every flow of the API and its plans.
    ///
    /// Fails deployment on an invalid regex or an unknown policy type, so a
    /// broken definition is rejected before it can serve traffic.
    pub fn compile(api: &Api, policies: &PolicyRegistry) -> GatewayResult<Self> {
        let api_flows = api
            .flows
            .iter()
            .map(|f| CompiledFlow::compile(f, policies))
            .collect::<GatewayResult<Vec<_>>>()?;

        let mut plan_flows = HashMap::new();
        for plan in &api.plans {
            let compiled = plan
                .flows
                .iter()
                .map(|f| CompiledFlow::compile(f, policies))
                .collect::<GatewayResult<Vec<_>>>()?;
            plan_flows.insert(plan.id.clone(), compiled);
        }

        debug!(
            api = %api.id,
            api_flows = api_flows.len(),
            plans = plan_flows.len(),
            "Flows compiled"
        );

        Ok(Self {
            api_flows,
            plan_flows,
        })
    }

    /// Resolve the ordered policy plans for this request.
    ///
    /// Pure over the compiled definition and the request attributes:
    /// resolving twice with the same inputs yields the same lists.
    pub fn resolve(&self, ctx: &ExecutionContext) -> ResolvedFlows {
        // Flow paths are relative to the API context path.
        let sub_path = sub_path(&ctx.request.path, &ctx.api().context_path);

        let plan_set = ctx
            .plan()
            .and_then(|plan| self.plan_flows.get(plan))
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut resolved = ResolvedFlows::default();
        for flow in self.api_flows.iter().chain(plan_set) {
            if flow.matches(ctx, sub_path) {
                trace!(
                    request_id = %ctx.request_id(),
                    flow = flow.name.as_deref().unwrap_or("<unnamed>"),
                    pre = flow.pre.len(),
                    post = flow.post.len(),
                    "Flow matched"
                );
                resolved.pre.extend(flow.pre.iter().cloned());
                resolved.post.extend(flow.post.iter().cloned());
            }
        }
        resolved
    }
}

fn sub_path<'a>(path: &'a str, context_path: &str) -> &'a str {
    match path.strip_prefix(context_path) {
        Some("") => "/",
        Some(rest) => rest,
        None => path,
    }
}
