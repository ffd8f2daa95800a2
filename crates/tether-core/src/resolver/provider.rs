//! Resolver providers and the scheme-keyed registry that picks between them.

use super::{IntentResolver, Resolver, ResolverArgs};
use crate::config::ResolverConfig;
use crate::directory::{ChangeRegistry, ServiceDirectory};
use std::sync::Arc;
use tracing::debug;

/// Factory for resolvers of one target scheme.
pub trait ResolverProvider: Send + Sync {
    fn default_scheme(&self) -> &str;
    fn is_available(&self) -> bool;
    /// Higher wins when several providers claim a scheme.
    fn priority(&self) -> i32;
    /// `None` if the target is not for this provider.
    fn new_resolver(&self, target: &str, args: &ResolverArgs) -> Option<Box<dyn Resolver>>;
}

/// Scheme of a target string, without validating the rest.
fn target_scheme(target: &str) -> Option<&str> {
    target.split_once(':').map(|(scheme, _)| scheme)
}

/// Resolves `intent:` targets against a service directory.
pub struct IntentResolverProvider {
    directory: Arc<dyn ServiceDirectory>,
    registry: Arc<dyn ChangeRegistry>,
}

impl IntentResolverProvider {
    pub fn new(directory: Arc<dyn ServiceDirectory>, registry: Arc<dyn ChangeRegistry>) -> Self {
        Self {
            directory,
            registry,
        }
    }

    /// Provider over a directory that is also its own change registry.
    pub fn for_directory<D>(directory: Arc<D>) -> Self
    where
        D: ServiceDirectory + ChangeRegistry + 'static,
    {
        Self::new(directory.clone(), directory)
    }
}

impl ResolverProvider for IntentResolverProvider {
    fn default_scheme(&self) -> &str {
        ResolverConfig::INTENT_SCHEME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        ResolverConfig::DEFAULT_PRIORITY
    }

    fn new_resolver(&self, target: &str, args: &ResolverArgs) -> Option<Box<dyn Resolver>> {
        if target_scheme(target) != Some(ResolverConfig::INTENT_SCHEME) {
            return None;
        }
        Some(Box::new(IntentResolver::new(
            target,
            self.directory.clone(),
            self.registry.clone(),
            args.clone(),
        )))
    }
}

/// Known providers, consulted in priority order.
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    providers: Vec<Arc<dyn ResolverProvider>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ResolverProvider>) {
        debug!(
            "Registered resolver provider for '{}' (priority {})",
            provider.default_scheme(),
            provider.priority()
        );
        self.providers.push(provider);
        // Stable: equal priorities keep registration order.
        self.providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    pub fn with(mut self, provider: Arc<dyn ResolverProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Scheme of the best available provider.
    pub fn default_scheme(&self) -> Option<&str> {
        self.available().next().map(|p| p.default_scheme())
    }

    /// Resolver from the best available provider that accepts `target`.
    pub fn new_resolver(&self, target: &str, args: &ResolverArgs) -> Option<Box<dyn Resolver>> {
        self.available().find_map(|p| p.new_resolver(target, args))
    }

    fn available(&self) -> impl Iterator<Item = &Arc<dyn ResolverProvider>> {
        self.providers.iter().filter(|p| p.is_available())
    }
}
