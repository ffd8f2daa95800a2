//! Service directory: which installed components can serve a descriptor, and
//! notification when that answer may have changed.
//!
//! The resolver only depends on the [`ServiceDirectory`] and [`ChangeRegistry`]
//! traits. [`SqliteDirectory`] is the bundled implementation.

mod filter;
mod sqlite;

pub use filter::CapabilityFilter;
pub use sqlite::SqliteDirectory;

use crate::descriptor::{ComponentName, Descriptor};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// An installed component able to serve some descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub component: ComponentName,
    pub filter: CapabilityFilter,
    pub enabled: bool,
    pub installed_at: String,
}

/// Answers "who can serve this descriptor?".
pub trait ServiceDirectory: Send + Sync {
    /// Matching providers in enumeration order. An empty list is a valid answer.
    fn query_services(&self, descriptor: &Descriptor) -> Result<Vec<ProviderInfo>>;
}

/// Kind of package event a registration can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    PackageAdded,
    PackageChanged,
    PackageRemoved,
    PackageReplaced,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::PackageAdded => "package_added",
            ChangeKind::PackageChanged => "package_changed",
            ChangeKind::PackageRemoved => "package_removed",
            ChangeKind::PackageReplaced => "package_replaced",
        };
        f.write_str(name)
    }
}

/// One directory change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub package: String,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, package: impl Into<String>) -> Self {
        Self {
            kind,
            package: package.into(),
        }
    }

    /// Data URI of the event, e.g. `package:com.example`.
    pub fn data_uri(&self) -> String {
        format!("{}:{}", ChangeFilter::PACKAGE_SCHEME, self.package)
    }
}

/// Which events a registration receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    kinds: BTreeSet<ChangeKind>,
    data_scheme: String,
}

impl ChangeFilter {
    pub const PACKAGE_SCHEME: &'static str = "package";

    /// All four package events on the `package` data scheme.
    pub fn package_events() -> Self {
        Self {
            kinds: [
                ChangeKind::PackageAdded,
                ChangeKind::PackageChanged,
                ChangeKind::PackageRemoved,
                ChangeKind::PackageReplaced,
            ]
            .into_iter()
            .collect(),
            data_scheme: Self::PACKAGE_SCHEME.to_string(),
        }
    }

    pub fn only(kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            data_scheme: Self::PACKAGE_SCHEME.to_string(),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.kinds.iter().copied()
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.kinds.contains(&event.kind)
            && event
                .data_uri()
                .split_once(':')
                .is_some_and(|(scheme, _)| scheme == self.data_scheme)
    }
}

/// Receives directory change events.
pub trait ChangeReceiver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Registers receivers for directory changes.
pub trait ChangeRegistry: Send + Sync {
    /// Register `receiver`. It stays registered until the returned
    /// [`Subscription`] is released or dropped.
    fn register(&self, filter: ChangeFilter, receiver: Arc<dyn ChangeReceiver>) -> Result<Subscription>;

    /// Number of live registrations.
    fn registered_count(&self) -> usize;
}

/// Live registration. Unregisters on [`Subscription::release`] or drop.
pub struct Subscription {
    id: u64,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(id: u64, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing change subscription {}", self.id);
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("released", &self.release.is_none())
            .finish()
    }
}

type ReceiverEntry = (u64, ChangeFilter, Arc<dyn ChangeReceiver>);

/// In-process registration table backing a [`ChangeRegistry`].
#[derive(Default)]
pub struct ReceiverTable {
    next_id: AtomicU64,
    entries: Arc<Mutex<Vec<ReceiverEntry>>>,
}

impl ReceiverTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, filter: ChangeFilter, receiver: Arc<dyn ChangeReceiver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match self.entries.lock() {
            Ok(mut entries) => entries.push((id, filter, receiver)),
            Err(poisoned) => poisoned.into_inner().push((id, filter, receiver)),
        }
        let entries: Weak<Mutex<Vec<ReceiverEntry>>> = Arc::downgrade(&self.entries);
        Subscription::new(id, move || {
            if let Some(entries) = entries.upgrade() {
                if let Ok(mut entries) = entries.lock() {
                    entries.retain(|(entry_id, _, _)| *entry_id != id);
                }
            }
        })
    }

    /// Deliver `event` to every matching receiver. Receivers run without the
    /// table locked and may release their own subscription.
    pub fn broadcast(&self, event: &ChangeEvent) -> usize {
        let targets: Vec<Arc<dyn ChangeReceiver>> = match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, filter, _)| filter.matches(event))
                .map(|(_, _, receiver)| receiver.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        debug!("Broadcasting {} for {} to {} receivers", event.kind, event.package, targets.len());
        for receiver in &targets {
            receiver.on_change(event);
        }
        targets.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingReceiver {
        events: AtomicUsize,
    }

    impl ChangeReceiver for CountingReceiver {
        fn on_change(&self, _event: &ChangeEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_unregisters() {
        let table = ReceiverTable::new();
        let receiver = Arc::new(CountingReceiver::default());
        let subscription = table.register(ChangeFilter::package_events(), receiver.clone());
        assert_eq!(table.len(), 1);

        table.broadcast(&ChangeEvent::new(ChangeKind::PackageAdded, "pkg"));
        drop(subscription);
        table.broadcast(&ChangeEvent::new(ChangeKind::PackageAdded, "pkg"));

        assert!(table.is_empty());
        assert_eq!(receiver.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_selects_event_kinds() {
        let table = ReceiverTable::new();
        let receiver = Arc::new(CountingReceiver::default());
        let _subscription = table.register(
            ChangeFilter::only([ChangeKind::PackageRemoved]),
            receiver.clone(),
        );

        assert_eq!(table.broadcast(&ChangeEvent::new(ChangeKind::PackageAdded, "pkg")), 0);
        assert_eq!(table.broadcast(&ChangeEvent::new(ChangeKind::PackageRemoved, "pkg")), 1);
        assert_eq!(receiver.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_is_explicit_and_single() {
        let table = ReceiverTable::new();
        let subscription = table.register(
            ChangeFilter::package_events(),
            Arc::new(CountingReceiver::default()),
        );
        let _other = table.register(
            ChangeFilter::package_events(),
            Arc::new(CountingReceiver::default()),
        );

        subscription.release();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_package_event_data_uri() {
        let event = ChangeEvent::new(ChangeKind::PackageReplaced, "com.example");
        assert_eq!(event.data_uri(), "package:com.example");
        assert!(ChangeFilter::package_events().matches(&event));
    }
}
