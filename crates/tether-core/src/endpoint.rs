//! Endpoint wrappers over the one-way call primitive.
//!
//! The primitive itself is abstracted by [`OneWayHandle`]: an opaque peer
//! identity that accepts fire-and-forget transactions and reports its death.
//!
//! - [`OneWayProxy`] is the sending side: a single `send(code, parcel)`.
//! - [`LeakSafeEndpoint`] is the receiving side: it forwards inbound
//!   transactions to an installed [`TransactionHandler`] held only weakly, so
//!   installing a handler never keeps its owner alive.
//! - [`LocalHandle`] is an in-process primitive used by the CLI and tests.
//!
//! # Locking
//!
//! Sends are synchronous with respect to the primitive, and a local peer may
//! dispatch straight back into the caller. Never call `send` or `transact`
//! while holding a lock that an inbound handler could take.

use crate::parcel::Parcel;
use crate::{Result, TetherError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Handles inbound transactions addressed to an endpoint.
pub trait TransactionHandler: Send + Sync {
    /// Process one transaction. Returns `false` when the code or payload is
    /// not recognized so that a fallback handler can run.
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool;
}

/// Notified when the peer behind a handle dies.
pub trait DeathRecipient: Send + Sync {
    fn binder_died(&self);
}

/// Raw one-way call handle.
pub trait OneWayHandle: Send + Sync {
    /// Process-unique identity of the handle.
    fn handle_id(&self) -> u64;

    /// Send a one-way transaction. `Ok(false)` means it was not enqueued.
    fn transact(&self, code: u32, parcel: &Parcel) -> Result<bool>;

    /// Register for death notification. Fails if the peer is already dead.
    fn link_to_death(&self, recipient: Weak<dyn DeathRecipient>) -> Result<()>;

    /// Returns `true` if the recipient was registered.
    fn unlink_to_death(&self, recipient: &Weak<dyn DeathRecipient>) -> bool;

    fn is_alive(&self) -> bool;
}

/// Sending side of a connection.
#[derive(Clone)]
pub struct OneWayProxy {
    handle: Arc<dyn OneWayHandle>,
}

impl OneWayProxy {
    pub fn new(handle: Arc<dyn OneWayHandle>) -> Self {
        Self { handle }
    }

    /// Send a one-way transaction, turning a refused enqueue into an error.
    pub fn send(&self, code: u32, parcel: &Parcel) -> Result<()> {
        if self.handle.transact(code, parcel)? {
            Ok(())
        } else {
            Err(TetherError::TransactionFailed {
                code,
                message: format!("handle {} refused the transaction", self.handle.handle_id()),
            })
        }
    }

    pub fn handle(&self) -> &Arc<dyn OneWayHandle> {
        &self.handle
    }
}

impl std::fmt::Debug for OneWayProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneWayProxy")
            .field("handle", &self.handle.handle_id())
            .finish()
    }
}

/// Receiving side of a connection.
///
/// Holds its handler weakly: the handler's owner typically owns this endpoint
/// too, and a strong reference here would form a cycle.
#[derive(Default)]
pub struct LeakSafeEndpoint {
    handler: Mutex<Option<Weak<dyn TransactionHandler>>>,
}

impl LeakSafeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install the handler for inbound transactions, replacing any previous one.
    pub fn set_handler(&self, handler: Weak<dyn TransactionHandler>) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }
    }

    /// Drop the installed handler. Later transactions are not handled.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = None;
        }
    }

    /// Forward a transaction to the handler, if it is still alive.
    pub fn dispatch(&self, code: u32, parcel: &mut Parcel) -> bool {
        let handler = match self.handler.lock() {
            Ok(slot) => slot.as_ref().and_then(Weak::upgrade),
            Err(_) => None,
        };
        match handler {
            Some(handler) => handler.handle_transaction(code, parcel),
            None => {
                debug!("Dropping transaction {}: no handler installed", code);
                false
            }
        }
    }
}

/// In-process one-way primitive delivering straight into a [`LeakSafeEndpoint`].
pub struct LocalHandle {
    id: u64,
    endpoint: Arc<LeakSafeEndpoint>,
    alive: AtomicBool,
    recipients: Mutex<Vec<Weak<dyn DeathRecipient>>>,
}

impl LocalHandle {
    pub fn new(endpoint: Arc<LeakSafeEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            alive: AtomicBool::new(true),
            recipients: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &Arc<LeakSafeEndpoint> {
        &self.endpoint
    }

    /// Simulate the owning process dying: later transactions fail and every
    /// linked recipient is notified once.
    pub fn kill(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let recipients = match self.recipients.lock() {
            Ok(mut list) => std::mem::take(&mut *list),
            Err(_) => Vec::new(),
        };
        debug!("Handle {} died, notifying {} recipients", self.id, recipients.len());
        for recipient in recipients.iter().filter_map(Weak::upgrade) {
            recipient.binder_died();
        }
    }
}

impl OneWayHandle for LocalHandle {
    fn handle_id(&self) -> u64 {
        self.id
    }

    fn transact(&self, code: u32, parcel: &Parcel) -> Result<bool> {
        if !self.is_alive() {
            return Err(TetherError::DeadObject { handle: self.id });
        }
        let mut delivered = parcel.clone();
        delivered.set_read_position(0);
        if !self.endpoint.dispatch(code, &mut delivered) {
            warn!("Transaction {} to handle {} was not handled", code, self.id);
        }
        // One-way: enqueued regardless of whether anyone claimed it.
        Ok(true)
    }

    fn link_to_death(&self, recipient: Weak<dyn DeathRecipient>) -> Result<()> {
        if !self.is_alive() {
            return Err(TetherError::DeadObject { handle: self.id });
        }
        let mut list = self
            .recipients
            .lock()
            .map_err(|_| TetherError::Other("death recipient list poisoned".to_string()))?;
        list.push(recipient);
        Ok(())
    }

    fn unlink_to_death(&self, recipient: &Weak<dyn DeathRecipient>) -> bool {
        let Ok(mut list) = self.recipients.lock() else {
            return false;
        };
        let before = list.len();
        list.retain(|r| !Weak::ptr_eq(r, recipient));
        list.len() != before
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl TransactionHandler for CountingHandler {
        fn handle_transaction(&self, _code: u32, _parcel: &mut Parcel) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Default)]
    struct DeathFlag {
        died: AtomicBool,
    }

    impl DeathRecipient for DeathFlag {
        fn binder_died(&self) {
            self.died.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_reaches_installed_handler() {
        let endpoint = LeakSafeEndpoint::new();
        let handler = Arc::new(CountingHandler::default());
        let weak = Arc::downgrade(&handler) as Weak<dyn TransactionHandler>;
        endpoint.set_handler(weak);

        let handle = LocalHandle::new(endpoint);
        OneWayProxy::new(handle).send(42, &Parcel::new()).unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_endpoint_does_not_keep_handler_alive() {
        let endpoint = LeakSafeEndpoint::new();
        let handler = Arc::new(CountingHandler::default());
        let weak = Arc::downgrade(&handler) as Weak<dyn TransactionHandler>;
        endpoint.set_handler(weak);

        drop(handler);
        assert!(!endpoint.dispatch(1, &mut Parcel::new()));
    }

    #[test]
    fn test_detach_stops_dispatch() {
        let endpoint = LeakSafeEndpoint::new();
        let handler = Arc::new(CountingHandler::default());
        let weak = Arc::downgrade(&handler) as Weak<dyn TransactionHandler>;
        endpoint.set_handler(weak);
        endpoint.detach();

        assert!(!endpoint.dispatch(1, &mut Parcel::new()));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kill_notifies_recipients_and_fails_sends() {
        let handle = LocalHandle::new(LeakSafeEndpoint::new());
        let flag = Arc::new(DeathFlag::default());
        let weak = Arc::downgrade(&flag) as Weak<dyn DeathRecipient>;
        handle.link_to_death(weak).unwrap();

        handle.kill();

        assert!(flag.died.load(Ordering::SeqCst));
        let err = OneWayProxy::new(handle.clone())
            .send(1, &Parcel::new())
            .unwrap_err();
        assert!(err.is_dead_object());

        let weak = Arc::downgrade(&flag) as Weak<dyn DeathRecipient>;
        assert!(handle.link_to_death(weak).is_err());
    }

    #[test]
    fn test_unlink_removes_recipient() {
        let handle = LocalHandle::new(LeakSafeEndpoint::new());
        let flag = Arc::new(DeathFlag::default());
        let weak = Arc::downgrade(&flag) as Weak<dyn DeathRecipient>;
        handle.link_to_death(weak.clone()).unwrap();

        assert!(handle.unlink_to_death(&weak));
        handle.kill();
        assert!(!flag.died.load(Ordering::SeqCst));
    }
}
