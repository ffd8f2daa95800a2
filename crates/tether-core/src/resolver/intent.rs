//! Resolver for `intent:` targets backed by the service directory.

use super::{Resolution, ResolutionResult, Resolver, ResolverArgs, ResolverListener};
use crate::address::{AddressGroup, ComponentAddress};
use crate::config::ResolverConfig;
use crate::descriptor::Descriptor;
use crate::directory::{ChangeEvent, ChangeFilter, ChangeReceiver, ChangeRegistry, ServiceDirectory, Subscription};
use crate::executor::SequentialExecutor;
use crate::status::{Code, Status};
use crate::{Result, TetherError};
use serde_json::Map;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

#[derive(Default)]
struct ResolverState {
    listener: Option<Arc<dyn ResolverListener>>,
    shutdown: bool,
}

struct ResolverInner {
    target: String,
    directory: Arc<dyn ServiceDirectory>,
    registry: Arc<dyn ChangeRegistry>,
    args: ResolverArgs,
    sequential: SequentialExecutor,
    // Only touched from jobs on `sequential`.
    subscription: Mutex<Option<Subscription>>,
    state: Mutex<ResolverState>,
}

/// Resolves an `intent:` target to one address group per matching provider
/// and re-resolves whenever the directory reports a package change.
///
/// Directory work runs on a private [`SequentialExecutor`], so at most one
/// resolution is in flight and results arrive in the order resolutions were
/// requested. Results are delivered on the channel's sync context, and never
/// after [`Resolver::shutdown`].
pub struct IntentResolver {
    inner: Arc<ResolverInner>,
}

impl IntentResolver {
    pub fn new(
        target: impl Into<String>,
        directory: Arc<dyn ServiceDirectory>,
        registry: Arc<dyn ChangeRegistry>,
        args: ResolverArgs,
    ) -> Self {
        let sequential = SequentialExecutor::new(args.offload());
        Self {
            inner: Arc::new(ResolverInner {
                target: target.into(),
                directory,
                registry,
                args,
                sequential,
                subscription: Mutex::new(None),
                state: Mutex::new(ResolverState::default()),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Wait until every resolution queued so far has run.
    pub async fn flush(&self) {
        self.inner.sequential.flush().await;
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ResolverState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| TetherError::Other("resolver state lock poisoned".to_string()))
    }
}

impl Resolver for IntentResolver {
    fn start(&self, listener: Arc<dyn ResolverListener>) -> Result<()> {
        {
            let mut state = self.lock_state()?;
            if state.listener.is_some() {
                return Err(TetherError::IllegalState("Already started!".to_string()));
            }
            if state.shutdown {
                return Err(TetherError::IllegalState("Resolver is shutdown".to_string()));
            }
            state.listener = Some(listener);
        }
        debug!("Starting resolver for {}", self.inner.target);
        ResolverInner::resolve(&self.inner);
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        if self.lock_state()?.listener.is_none() {
            return Err(TetherError::IllegalState("Not started!".to_string()));
        }
        ResolverInner::resolve(&self.inner);
        Ok(())
    }

    fn shutdown(&self) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        drop(state);

        debug!("Shutting down resolver for {}", self.inner.target);
        let inner = self.inner.clone();
        self.inner.sequential.execute(move || inner.unregister());
    }

    fn service_authority(&self) -> &str {
        ResolverConfig::SERVICE_AUTHORITY
    }
}

impl ResolverInner {
    fn resolve(this: &Arc<Self>) {
        let listener = match this.state.lock() {
            Ok(state) if !state.shutdown => state.listener.clone(),
            _ => None,
        };
        let Some(listener) = listener else {
            return;
        };

        let inner = this.clone();
        this.sequential.execute(move || {
            let resolution = match inner.register() {
                Ok(()) => inner.lookup(),
                Err(e) => Resolution::Failure(
                    Status::internal()
                        .with_description("Failed to subscribe to directory changes")
                        .with_cause(&e),
                ),
            };
            let sync_context = inner.args.sync_context().clone();
            sync_context.execute(move || inner.deliver(&*listener, resolution));
        });
    }

    /// One directory lookup for the target. Parses before querying.
    fn lookup(&self) -> Resolution {
        let descriptor = match Descriptor::parse(&self.target) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                return Resolution::Failure(
                    Status::new(Code::InvalidArgument)
                        .with_description(format!("Failed to parse target URI {} as intent", self.target))
                        .with_cause(&e),
                )
            }
        };

        let providers = match self.directory.query_services(&descriptor) {
            Ok(providers) => providers,
            Err(e) => {
                return Resolution::Failure(
                    Status::internal()
                        .with_description(format!("Directory query failed for {}", descriptor))
                        .with_cause(&e),
                )
            }
        };
        if providers.is_empty() {
            return Resolution::Failure(
                Status::new(Code::Unimplemented)
                    .with_description(format!("Service not found for intent {}", descriptor)),
            );
        }

        // Each provider is modeled as its own server with a single address.
        let filter = descriptor.filter_copy();
        let servers = providers
            .into_iter()
            .map(|provider| {
                let bind = filter.clone().with_component(provider.component);
                AddressGroup::single(ComponentAddress::for_bind_descriptor(bind))
            })
            .collect();

        match self.args.service_config_parser().parse_service_config(&Map::new()) {
            Ok(config) => Resolution::Success(ResolutionResult::new(servers, config)),
            Err(e) => Resolution::Failure(
                Status::internal()
                    .with_description("Failed to parse default service config")
                    .with_cause(&e),
            ),
        }
    }

    fn deliver(&self, listener: &dyn ResolverListener, resolution: Resolution) {
        let shutdown = self.state.lock().map(|state| state.shutdown).unwrap_or(true);
        if shutdown {
            debug!("Dropping resolution for {} after shutdown", self.target);
            return;
        }
        match resolution {
            Resolution::Success(result) => listener.on_result(result),
            Resolution::Failure(status) => {
                debug!("Resolution of {} failed: {}", self.target, status);
                listener.on_error(status);
            }
        }
    }

    fn register(self: &Arc<Self>) -> Result<()> {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|_| TetherError::Other("subscription lock poisoned".to_string()))?;
        if subscription.is_some() {
            return Ok(());
        }
        // Registering after the unregister job would leak the subscription.
        if self.state.lock().map(|state| state.shutdown).unwrap_or(true) {
            return Ok(());
        }
        let receiver = Arc::new(PackageChangeReceiver {
            resolver: Arc::downgrade(self),
        });
        *subscription = Some(self.registry.register(ChangeFilter::package_events(), receiver)?);
        debug!("Subscribed to package changes for {}", self.target);
        Ok(())
    }

    fn unregister(&self) {
        match self.subscription.lock() {
            Ok(mut subscription) => {
                if let Some(subscription) = subscription.take() {
                    subscription.release();
                }
            }
            Err(_) => warn!("Subscription lock poisoned while shutting down {}", self.target),
        }
    }
}

/// Turns a directory change into a refresh on the sync context.
struct PackageChangeReceiver {
    resolver: Weak<ResolverInner>,
}

impl ChangeReceiver for PackageChangeReceiver {
    fn on_change(&self, event: &ChangeEvent) {
        let Some(inner) = self.resolver.upgrade() else {
            return;
        };
        debug!("{} changed, refreshing {}", event.data_uri(), inner.target);

        let sync_context = inner.args.sync_context().clone();
        let offload = inner.args.offload().clone();
        sync_context.execute_later(move || ResolverInner::resolve(&inner));
        offload.spawn_blocking(move || sync_context.drain());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ComponentName;
    use crate::directory::{CapabilityFilter, ProviderInfo, ReceiverTable};
    use crate::executor::{panic_message, SyncContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Directory double with a fixed answer that counts queries.
    #[derive(Default)]
    struct FixedDirectory {
        providers: Mutex<Vec<ComponentName>>,
        queries: AtomicUsize,
        receivers: ReceiverTable,
        fail_register: bool,
    }

    impl ServiceDirectory for FixedDirectory {
        fn query_services(&self, _descriptor: &Descriptor) -> Result<Vec<ProviderInfo>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .providers
                .lock()
                .unwrap()
                .iter()
                .map(|component| ProviderInfo {
                    id: component.to_string(),
                    component: component.clone(),
                    filter: CapabilityFilter::new(),
                    enabled: true,
                    installed_at: String::new(),
                })
                .collect())
        }
    }

    impl ChangeRegistry for FixedDirectory {
        fn register(&self, filter: ChangeFilter, receiver: Arc<dyn ChangeReceiver>) -> Result<Subscription> {
            if self.fail_register {
                return Err(TetherError::Other("registry unavailable".to_string()));
            }
            Ok(self.receivers.register(filter, receiver))
        }

        fn registered_count(&self) -> usize {
            self.receivers.len()
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        results: Mutex<Vec<ResolutionResult>>,
        errors: Mutex<Vec<Status>>,
        panic_on_result: bool,
    }

    impl ResolverListener for RecordingListener {
        fn on_result(&self, result: ResolutionResult) {
            self.results.lock().unwrap().push(result);
            if self.panic_on_result {
                panic!("listener rejected result");
            }
        }

        fn on_error(&self, status: Status) {
            self.errors.lock().unwrap().push(status);
        }
    }

    const TARGET: &str = "intent:#Intent;action=action1;end";

    fn resolver_for(target: &str, directory: Arc<FixedDirectory>, sync_context: SyncContext) -> IntentResolver {
        let args = ResolverArgs::new(sync_context, tokio::runtime::Handle::current());
        IntentResolver::new(target, directory.clone(), directory, args)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_fails_without_side_effects() {
        let directory = Arc::new(FixedDirectory::default());
        let resolver = resolver_for(TARGET, directory.clone(), SyncContext::new());
        let listener = Arc::new(RecordingListener::default());

        resolver.start(listener.clone()).unwrap();
        resolver.flush().await;
        let err = resolver.start(listener.clone()).unwrap_err();
        resolver.flush().await;

        assert!(matches!(err, TetherError::IllegalState(ref m) if m == "Already started!"));
        assert_eq!(directory.queries.load(Ordering::SeqCst), 1);
        resolver.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_after_shutdown_fails() {
        let directory = Arc::new(FixedDirectory::default());
        let resolver = resolver_for(TARGET, directory.clone(), SyncContext::new());

        resolver.shutdown();
        let err = resolver.start(Arc::new(RecordingListener::default())).unwrap_err();
        resolver.flush().await;

        assert_eq!(err.status_code(), Code::FailedPrecondition);
        assert_eq!(directory.queries.load(Ordering::SeqCst), 0);
        assert_eq!(directory.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_before_start_fails() {
        let directory = Arc::new(FixedDirectory::default());
        let resolver = resolver_for(TARGET, directory, SyncContext::new());
        assert!(matches!(resolver.refresh(), Err(TetherError::IllegalState(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_extra_is_invalid_argument_without_query() {
        let directory = Arc::new(FixedDirectory::default());
        let resolver = resolver_for("intent:xxx#Intent;e.x=1;end;", directory.clone(), SyncContext::new());
        let listener = Arc::new(RecordingListener::default());

        resolver.start(listener.clone()).unwrap();
        resolver.flush().await;

        let errors = listener.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), Code::InvalidArgument);
        assert_eq!(directory.queries.load(Ordering::SeqCst), 0);
        assert!(listener.results.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_failure_is_internal_and_retryable() {
        let directory = Arc::new(FixedDirectory {
            fail_register: true,
            ..Default::default()
        });
        let resolver = resolver_for(TARGET, directory.clone(), SyncContext::new());
        let listener = Arc::new(RecordingListener::default());

        resolver.start(listener.clone()).unwrap();
        resolver.refresh().unwrap();
        resolver.flush().await;

        let errors = listener.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|s| s.code() == Code::Internal));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_in_on_result_does_not_reach_on_error() {
        let directory = Arc::new(FixedDirectory::default());
        directory
            .providers
            .lock()
            .unwrap()
            .push(ComponentName::new("pkg", "pkg.Svc"));

        let panics = Arc::new(Mutex::new(Vec::new()));
        let sink = panics.clone();
        let sync_context = SyncContext::with_panic_handler(move |payload| {
            sink.lock().unwrap().push(panic_message(payload));
        });
        let resolver = resolver_for(TARGET, directory, sync_context);
        let listener = Arc::new(RecordingListener {
            panic_on_result: true,
            ..Default::default()
        });

        resolver.start(listener.clone()).unwrap();
        resolver.refresh().unwrap();
        resolver.flush().await;

        assert_eq!(listener.results.lock().unwrap().len(), 2);
        assert!(listener.errors.lock().unwrap().is_empty());
        assert_eq!(panics.lock().unwrap().len(), 2);
        resolver.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_resolver_releases_subscription() {
        let directory = Arc::new(FixedDirectory::default());
        let resolver = resolver_for(TARGET, directory.clone(), SyncContext::new());
        resolver.start(Arc::new(RecordingListener::default())).unwrap();
        resolver.flush().await;
        assert_eq!(directory.registered_count(), 1);

        drop(resolver);
        for _ in 0..100 {
            if directory.registered_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(directory.registered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_service_authority() {
        let resolver = resolver_for(TARGET, Arc::new(FixedDirectory::default()), SyncContext::new());
        assert_eq!(resolver.service_authority(), "localhost");
    }
}
