//! Target resolution: from a descriptor to a live list of server addresses.
//!
//! A [`Resolver`] publishes [`ResolutionResult`]s to a [`ResolverListener`].
//! Every publication replaces the previous one. Resolvers are created by a
//! [`ResolverProvider`] chosen from a [`ResolverRegistry`] by target scheme.

mod intent;
mod provider;

pub use intent::IntentResolver;
pub use provider::{IntentResolverProvider, ResolverProvider, ResolverRegistry};

use crate::address::AddressGroup;
use crate::config::ResolverConfig;
use crate::executor::SyncContext;
use crate::status::Status;
use crate::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Opaque per-target service configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub load_balancing_policy: String,
    pub raw: Map<String, Value>,
}

/// Turns a raw service config map into a [`ServiceConfig`].
pub trait ServiceConfigParser: Send + Sync {
    fn parse_service_config(&self, raw: &Map<String, Value>) -> Result<ServiceConfig>;
}

/// Reads `loadBalancingPolicy`, defaulting to `pick_first`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultServiceConfigParser;

impl ServiceConfigParser for DefaultServiceConfigParser {
    fn parse_service_config(&self, raw: &Map<String, Value>) -> Result<ServiceConfig> {
        let policy = match raw.get("loadBalancingPolicy") {
            None => ResolverConfig::DEFAULT_LB_POLICY.to_string(),
            Some(Value::String(policy)) => policy.clone(),
            Some(other) => {
                return Err(crate::TetherError::Config {
                    message: format!("loadBalancingPolicy must be a string, got {}", other),
                })
            }
        };
        Ok(ServiceConfig {
            load_balancing_policy: policy,
            raw: raw.clone(),
        })
    }
}

/// One published answer: ordered address groups plus service config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionResult {
    addresses: Vec<AddressGroup>,
    service_config: ServiceConfig,
}

impl ResolutionResult {
    pub fn new(addresses: Vec<AddressGroup>, service_config: ServiceConfig) -> Self {
        Self {
            addresses,
            service_config,
        }
    }

    pub fn addresses(&self) -> &[AddressGroup] {
        &self.addresses
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.service_config
    }
}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Success(ResolutionResult),
    Failure(Status),
}

/// Receives a resolver's publications on the channel's [`SyncContext`].
pub trait ResolverListener: Send + Sync {
    fn on_result(&self, result: ResolutionResult);
    fn on_error(&self, status: Status);
}

/// A started resolver keeps publishing until shut down.
pub trait Resolver: Send + Sync {
    /// Store the listener and resolve. Fails if already started or shut down.
    fn start(&self, listener: Arc<dyn ResolverListener>) -> Result<()>;

    /// Resolve again. Fails if never started.
    fn refresh(&self) -> Result<()>;

    /// Stop publishing and release directory subscriptions. Idempotent.
    fn shutdown(&self);

    fn service_authority(&self) -> &str;
}

/// Everything a resolver gets from the channel that creates it.
#[derive(Clone)]
pub struct ResolverArgs {
    sync_context: SyncContext,
    offload: tokio::runtime::Handle,
    service_config_parser: Arc<dyn ServiceConfigParser>,
    target_user: Option<String>,
    security_policy: Option<String>,
}

impl ResolverArgs {
    pub fn new(sync_context: SyncContext, offload: tokio::runtime::Handle) -> Self {
        Self {
            sync_context,
            offload,
            service_config_parser: Arc::new(DefaultServiceConfigParser),
            target_user: None,
            security_policy: None,
        }
    }

    pub fn with_service_config_parser(mut self, parser: Arc<dyn ServiceConfigParser>) -> Self {
        self.service_config_parser = parser;
        self
    }

    /// User whose directory view addresses should be resolved in.
    pub fn with_target_user(mut self, user: impl Into<String>) -> Self {
        self.target_user = Some(user.into());
        self
    }

    /// Name of the security policy the channel will apply to servers.
    pub fn with_security_policy(mut self, policy: impl Into<String>) -> Self {
        self.security_policy = Some(policy.into());
        self
    }

    pub fn sync_context(&self) -> &SyncContext {
        &self.sync_context
    }

    pub fn offload(&self) -> &tokio::runtime::Handle {
        &self.offload
    }

    pub fn service_config_parser(&self) -> &Arc<dyn ServiceConfigParser> {
        &self.service_config_parser
    }

    pub fn target_user(&self) -> Option<&str> {
        self.target_user.as_deref()
    }

    pub fn security_policy(&self) -> Option<&str> {
        self.security_policy.as_deref()
    }
}

impl std::fmt::Debug for ResolverArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverArgs")
            .field("target_user", &self.target_user)
            .field("security_policy", &self.security_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_config_defaults_to_pick_first() {
        let config = DefaultServiceConfigParser.parse_service_config(&Map::new()).unwrap();
        assert_eq!(config.load_balancing_policy, "pick_first");
        assert!(config.raw.is_empty());
    }

    #[test]
    fn test_explicit_policy_is_kept() {
        let raw = json!({"loadBalancingPolicy": "round_robin"});
        let config = DefaultServiceConfigParser
            .parse_service_config(raw.as_object().unwrap())
            .unwrap();
        assert_eq!(config.load_balancing_policy, "round_robin");
    }

    #[test]
    fn test_non_string_policy_is_rejected() {
        let raw = json!({"loadBalancingPolicy": 3});
        assert!(DefaultServiceConfigParser
            .parse_service_config(raw.as_object().unwrap())
            .is_err());
    }

    #[tokio::test]
    async fn test_resolver_args_carry_channel_settings() {
        let args = ResolverArgs::new(SyncContext::new(), tokio::runtime::Handle::current())
            .with_target_user("alice")
            .with_security_policy("same-uid");

        assert_eq!(args.target_user(), Some("alice"));
        assert_eq!(args.security_policy(), Some("same-uid"));
        let config = args.service_config_parser().parse_service_config(&Map::new()).unwrap();
        assert_eq!(config.load_balancing_policy, ResolverConfig::DEFAULT_LB_POLICY);
    }
}
