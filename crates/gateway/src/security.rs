//! Security chain: plan selection and authentication.
//!
//! Each plan of an API carries a security type ("api-key", "bearer",
//! "keyless"). At deployment the chain resolves each plan's provider and
//! orders the plans by provider strength, keyless last. Per request the
//! chain walks the ordered plans and the first provider whose credentials
//! are *present* becomes binding: its validation outcome decides the
//! request, with no fallback to a weaker plan on failure. Presence and
//! validity are deliberately separate checks, so a wrong API key is a 401,
//! never a silent downgrade to keyless.

use async_trait::async_trait;
use portcullis_common::{ApiId, GatewayError, GatewayResult, PlanId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::definition::{Api, Plan};
use crate::policy::chain::{ChainOutcome, Phase, PolicyChain};
use crate::policy::{Policy, PolicyOutcome};

/// Attribute under which the authenticated consumer identity is published
pub const ATTR_CONSUMER: &str = "security.consumer";

/// Header and query parameter carrying an API key
const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_QUERY_PARAM: &str = "api-key";

/// Validates API keys against the subscription store.
///
/// Registered as a component; the gateway core does not know where keys
/// live. Returns the consumer identity bound to a valid key.
#[async_trait]
pub trait ApiKeyValidator: Send + Sync {
    async fn validate(
        &self,
        api: &ApiId,
        plan: &PlanId,
        key: &str,
    ) -> GatewayResult<Option<String>>;
}

/// Validates bearer tokens and resolves them to a consumer identity
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, api: &ApiId, token: &str) -> GatewayResult<Option<String>>;
}

/// Component wrapper so validators are reachable through the type-keyed
/// provider
pub struct ApiKeyService {
    validator: Box<dyn ApiKeyValidator>,
}

impl ApiKeyService {
    pub fn new(validator: Box<dyn ApiKeyValidator>) -> Self {
        Self { validator }
    }

    pub async fn validate(
        &self,
        api: &ApiId,
        plan: &PlanId,
        key: &str,
    ) -> GatewayResult<Option<String>> {
        self.validator.validate(api, plan, key).await
    }
}

pub struct TokenService {
    validator: Box<dyn TokenValidator>,
}

impl TokenService {
    pub fn new(validator: Box<dyn TokenValidator>) -> Self {
        Self { validator }
    }

    pub async fn validate(&self, api: &ApiId, token: &str) -> GatewayResult<Option<String>> {
        self.validator.validate(api, token).await
    }
}

/// Authentication scheme implementation behind a plan security type
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    /// Security type string this provider handles
    fn security_type(&self) -> &'static str;

    /// Chain position; lower runs first, keyless is last
    fn order(&self) -> i32;

    /// Credential-presence probe. Cheap, no validation, no I/O.
    fn can_handle(&self, ctx: &ExecutionContext, plan: &Plan) -> bool;

    /// Validate the presented credentials.
    ///
    /// On success publishes the consumer identity into the context
    /// attributes. A validation miss is an error, never a pass-through.
    async fn authenticate(&self, ctx: &mut ExecutionContext, plan: &Plan) -> GatewayResult<()>;
}

/// API key in the `x-api-key` header or the `api-key` query parameter
pub struct ApiKeyProvider;

fn presented_api_key(ctx: &ExecutionContext) -> Option<String> {
    ctx.request
        .header(API_KEY_HEADER)
        .or_else(|| ctx.request.query_param(API_KEY_QUERY_PARAM))
        .map(str::to_string)
}

#[async_trait]
impl SecurityProvider for ApiKeyProvider {
    fn security_type(&self) -> &'static str {
        "api-key"
    }

    fn order(&self) -> i32 {
        200
    }

    fn can_handle(&self, ctx: &ExecutionContext, _plan: &Plan) -> bool {
        presented_api_key(ctx).is_some()
    }

    async fn authenticate(&self, ctx: &mut ExecutionContext, plan: &Plan) -> GatewayResult<()> {
        let key = presented_api_key(ctx).ok_or(GatewayError::AuthenticationRequired)?;

        let service = ctx.component::<ApiKeyService>().ok_or_else(|| {
            GatewayError::internal("api key validator component not registered")
        })?;

        let api = ctx.api().id.clone();
        match service.validate(&api, &plan.id, &key).await? {
            Some(consumer) => {
                debug!(consumer = %consumer, plan = %plan.id, "API key accepted");
                ctx.set_attribute(ATTR_CONSUMER, serde_json::Value::String(consumer));
                Ok(())
            }
            None => Err(GatewayError::AuthenticationFailed {
                reason: "invalid API key".to_string(),
            }),
        }
    }
}

/// Bearer token in the `Authorization` header
pub struct BearerProvider;

fn presented_bearer(ctx: &ExecutionContext) -> Option<String> {
    let value = ctx.request.header("authorization")?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[async_trait]
impl SecurityProvider for BearerProvider {
    fn security_type(&self) -> &'static str {
        "bearer"
    }

    fn order(&self) -> i32 {
        100
    }

    fn can_handle(&self, ctx: &ExecutionContext, _plan: &Plan) -> bool {
        presented_bearer(ctx).is_some()
    }

    async fn authenticate(&self, ctx: &mut ExecutionContext, _plan: &Plan) -> GatewayResult<()> {
        let token = presented_bearer(ctx).ok_or(GatewayError::AuthenticationRequired)?;

        let service = ctx
            .component::<TokenService>()
            .ok_or_else(|| GatewayError::internal("token validator component not registered"))?;

        let api = ctx.api().id.clone();
        match service.validate(&api, &token).await? {
            Some(consumer) => {
                debug!(consumer = %consumer, "Bearer token accepted");
                ctx.set_attribute(ATTR_CONSUMER, serde_json::Value::String(consumer));
                Ok(())
            }
            None => Err(GatewayError::AuthenticationFailed {
                reason: "invalid bearer token".to_string(),
            }),
        }
    }
}

/// No credentials required; accepts every request as anonymous.
///
/// Runs last in the chain so it only binds when no credentialed plan
/// claimed the request.
pub struct KeylessProvider;

#[async_trait]
impl SecurityProvider for KeylessProvider {
    fn security_type(&self) -> &'static str {
        "keyless"
    }

    fn order(&self) -> i32 {
        i32::MAX
    }

    fn can_handle(&self, _ctx: &ExecutionContext, _plan: &Plan) -> bool {
        true
    }

    async fn authenticate(&self, _ctx: &mut ExecutionContext, _plan: &Plan) -> GatewayResult<()> {
        Ok(())
    }
}

/// Provider lookup keyed by plan security type string
#[derive(Default)]
pub struct SecurityProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn SecurityProvider>>,
}

impl SecurityProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in providers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ApiKeyProvider));
        registry.register(Arc::new(BearerProvider));
        registry.register(Arc::new(KeylessProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn SecurityProvider>) {
        debug!(
            security_type = provider.security_type(),
            order = provider.order(),
            "Security provider registered"
        );
        self.providers.insert(provider.security_type(), provider);
    }

    pub fn get(&self, security_type: &str) -> Option<Arc<dyn SecurityProvider>> {
        self.providers.get(security_type).cloned()
    }
}

struct SecurityPlan {
    plan: Plan,
    provider: Arc<dyn SecurityProvider>,
}

/// Adapter running a provider's validation as a policy chain step, so
/// authentication gets the chain engine's interruption and cancellation
/// semantics
struct AuthenticationStep {
    provider: Arc<dyn SecurityProvider>,
    plan: Plan,
}

#[async_trait]
impl Policy for AuthenticationStep {
    fn id(&self) -> &str {
        self.provider.security_type()
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> GatewayResult<PolicyOutcome> {
        self.provider.authenticate(ctx, &self.plan).await?;
        Ok(PolicyOutcome::Continue)
    }
}

/// Ordered plan list built once at API deployment
pub struct SecurityChain {
    plans: Vec<SecurityPlan>,
}

impl SecurityChain {
    /// Resolve providers for every plan and order them.
    ///
    /// Plans with an unknown security type are skipped with a warning, so
    /// one misconfigured plan does not take the whole API down. The sort is
    /// stable: plans sharing a provider keep declaration order.
    pub fn build(api: &Api, providers: &SecurityProviderRegistry) -> Self {
        let mut plans: Vec<SecurityPlan> = api
            .plans
            .iter()
            .filter_map(|plan| match providers.get(&plan.security) {
                Some(provider) => Some(SecurityPlan {
                    plan: plan.clone(),
                    provider,
                }),
                None => {
                    warn!(
                        api = %api.id,
                        plan = %plan.id,
                        security_type = %plan.security,
                        "Plan skipped: no provider for security type"
                    );
                    None
                }
            })
            .collect();

        plans.sort_by_key(|sp| sp.provider.order());
        Self { plans }
    }

    /// Select and authenticate exactly one plan for this request.
    ///
    /// The first plan whose provider reports credential presence is
    /// binding: success records the plan on the context, failure fails the
    /// request. Validation itself runs as a policy chain step, so it gets
    /// the engine's interruption and cancellation handling. No credentials
    /// and no keyless plan yields
    /// [`GatewayError::AuthenticationRequired`].
    pub async fn apply(&self, ctx: &mut ExecutionContext) -> GatewayResult<PlanId> {
        for sp in &self.plans {
            if !sp.provider.can_handle(ctx, &sp.plan) {
                continue;
            }

            debug!(
                request_id = %ctx.request_id(),
                plan = %sp.plan.id,
                security_type = sp.provider.security_type(),
                "Security plan selected"
            );

            let mut chain = PolicyChain::new(
                Phase::Request,
                vec![Box::new(AuthenticationStep {
                    provider: Arc::clone(&sp.provider),
                    plan: sp.plan.clone(),
                })],
            );
            return match chain.execute(ctx).await {
                ChainOutcome::Completed => {
                    ctx.set_plan(sp.plan.id.clone());
                    Ok(sp.plan.id.clone())
                }
                ChainOutcome::Failed(failure) if failure.status == 401 => {
                    Err(GatewayError::AuthenticationFailed {
                        reason: failure.message,
                    })
                }
                ChainOutcome::Failed(failure) => Err(GatewayError::policy(
                    failure.policy,
                    failure.status,
                    failure.message,
                )),
                ChainOutcome::ShortCircuited(_) => Err(GatewayError::internal(
                    "security provider short-circuited authentication",
                )),
                ChainOutcome::Cancelled => Err(GatewayError::internal("request cancelled")),
            };
        }

        Err(GatewayError::AuthenticationRequired)
    }
}
