//! Connection setup recognition and refusal.
//!
//! A client opens a connection by sending `SETUP_TRANSPORT` to a server's
//! well-known endpoint:
//!
//! ```text
//! [u32 BE: wire version][u64 BE: handle ref to the client's endpoint]
//! ```
//!
//! The protocol carries no magic number, so a handler can only decide
//! "this is mine" from the code, the length and the version.

use crate::config::WireConfig;
use crate::endpoint::{OneWayHandle, OneWayProxy, TransactionHandler};
use crate::parcel::Parcel;
use std::sync::Arc;
use tracing::{debug, warn};

/// A decoded `SETUP_TRANSPORT` request.
pub struct SetupRequest {
    pub version: u32,
    pub peer: Arc<dyn OneWayHandle>,
}

impl SetupRequest {
    /// Decode a setup request, or `None` if the transaction is not one we speak.
    pub fn parse(code: u32, parcel: &mut Parcel) -> Option<Self> {
        if code != WireConfig::SETUP_TRANSPORT {
            return None;
        }
        if parcel.data_avail() < WireConfig::SETUP_MIN_PAYLOAD {
            debug!("Ignoring short setup payload ({} bytes)", parcel.data_avail());
            return None;
        }
        let version = parcel.read_u32().ok()?;
        if version != WireConfig::WIRE_FORMAT_VERSION {
            debug!("Ignoring setup with unsupported wire version {}", version);
            return None;
        }
        let peer = parcel.read_handle().ok()?;
        Some(Self { version, peer })
    }

    /// Encode a setup request carrying `own_handle` as the reply address.
    pub fn encode(own_handle: Arc<dyn OneWayHandle>) -> Parcel {
        let mut parcel = Parcel::new();
        parcel.write_u32(WireConfig::WIRE_FORMAT_VERSION);
        parcel.write_handle(own_handle);
        parcel
    }
}

/// Build the `SHUTDOWN_TRANSPORT` payload.
pub fn shutdown_parcel() -> Parcel {
    let mut parcel = Parcel::new();
    // Never send an empty parcel; the flags word is always present.
    parcel.write_u32(WireConfig::SHUTDOWN_FLAGS);
    parcel
}

/// Speaks just enough of the wire protocol to tell clients to go away.
///
/// Every valid setup is answered with `SHUTDOWN_TRANSPORT` sent one-way to the
/// client's handle. Anything else is reported as not ours.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionRefusingHandler;

impl TransactionHandler for ConnectionRefusingHandler {
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool {
        let Some(setup) = SetupRequest::parse(code, parcel) else {
            return false;
        };

        let peer_id = setup.peer.handle_id();
        if let Err(e) = OneWayProxy::new(setup.peer).send(WireConfig::SHUTDOWN_TRANSPORT, &shutdown_parcel()) {
            warn!("Failed to send SHUTDOWN_TRANSPORT reply to handle {}: {}", peer_id, e);
        } else {
            debug!("Refused connection from handle {}", peer_id);
        }
        true
    }
}

/// Ordered list of handlers; the first one that claims a transaction wins.
///
/// The parcel's read cursor is rewound before each handler so a handler
/// that peeks and declines does not disturb the next one.
#[derive(Default, Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn TransactionHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn TransactionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn TransactionHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl TransactionHandler for HandlerChain {
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool {
        let start = parcel.read_position();
        for handler in &self.handlers {
            parcel.set_read_position(start);
            if handler.handle_transaction(code, parcel) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{DeathRecipient, LeakSafeEndpoint};
    use crate::{Result, TetherError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, Weak};

    /// Records every transaction it receives.
    #[derive(Default)]
    struct RecordingHandle {
        sent: Mutex<Vec<(u32, Vec<u32>)>>,
        fail: bool,
    }

    impl OneWayHandle for RecordingHandle {
        fn handle_id(&self) -> u64 {
            99
        }

        fn transact(&self, code: u32, parcel: &Parcel) -> Result<bool> {
            if self.fail {
                return Err(TetherError::DeadObject { handle: 99 });
            }
            let mut copy = parcel.clone();
            let mut words = Vec::new();
            while let Ok(word) = copy.read_u32() {
                words.push(word);
            }
            self.sent.lock().unwrap().push((code, words));
            Ok(true)
        }

        fn link_to_death(&self, _recipient: Weak<dyn DeathRecipient>) -> Result<()> {
            Ok(())
        }

        fn unlink_to_death(&self, _recipient: &Weak<dyn DeathRecipient>) -> bool {
            false
        }

        fn is_alive(&self) -> bool {
            !self.fail
        }
    }

    fn setup_from(peer: Arc<dyn OneWayHandle>, version: u32) -> Parcel {
        let mut parcel = Parcel::new();
        parcel.write_u32(version);
        parcel.write_handle(peer);
        parcel
    }

    #[test]
    fn test_valid_setup_is_answered_with_shutdown() {
        let peer = Arc::new(RecordingHandle::default());
        let mut parcel = setup_from(peer.clone(), WireConfig::WIRE_FORMAT_VERSION);

        assert!(ConnectionRefusingHandler.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut parcel));

        let sent = peer.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[(WireConfig::SHUTDOWN_TRANSPORT, vec![0])]);
    }

    #[test]
    fn test_other_codes_are_not_ours() {
        let peer = Arc::new(RecordingHandle::default());
        let mut parcel = setup_from(peer.clone(), WireConfig::WIRE_FORMAT_VERSION);

        assert!(!ConnectionRefusingHandler.handle_transaction(WireConfig::PING, &mut parcel));
        assert!(peer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_short_payload_is_not_ours() {
        let mut parcel = Parcel::new();
        parcel.write_u32(WireConfig::WIRE_FORMAT_VERSION);
        parcel.write_u32(0);

        assert!(!ConnectionRefusingHandler.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut parcel));
    }

    #[test]
    fn test_unsupported_version_is_not_ours() {
        let peer = Arc::new(RecordingHandle::default());
        let mut parcel = setup_from(peer.clone(), 2);

        assert!(!ConnectionRefusingHandler.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut parcel));
        assert!(peer.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_broken_reply_channel_is_swallowed() {
        let peer = Arc::new(RecordingHandle {
            fail: true,
            ..Default::default()
        });
        let mut parcel = setup_from(peer, WireConfig::WIRE_FORMAT_VERSION);

        assert!(ConnectionRefusingHandler.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut parcel));
    }

    struct Declining {
        seen: AtomicUsize,
    }

    impl TransactionHandler for Declining {
        fn handle_transaction(&self, _code: u32, parcel: &mut Parcel) -> bool {
            // Consume part of the payload before declining.
            let _ = parcel.read_u32();
            self.seen.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn test_chain_falls_through_to_refusal_with_rewound_parcel() {
        let declining = Arc::new(Declining {
            seen: AtomicUsize::new(0),
        });
        let chain = HandlerChain::new()
            .with(declining.clone())
            .with(Arc::new(ConnectionRefusingHandler));

        let peer = Arc::new(RecordingHandle::default());
        let mut parcel = setup_from(peer.clone(), WireConfig::WIRE_FORMAT_VERSION);

        assert!(chain.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut parcel));
        assert_eq!(declining.seen.load(Ordering::SeqCst), 1);
        assert_eq!(peer.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_refusal_over_local_endpoint() {
        let server = LeakSafeEndpoint::new();
        let refusing: Arc<dyn TransactionHandler> = Arc::new(ConnectionRefusingHandler);
        server.set_handler(Arc::downgrade(&refusing));

        let client = Arc::new(RecordingHandle::default());
        let mut parcel = SetupRequest::encode(client.clone());
        assert!(server.dispatch(WireConfig::SETUP_TRANSPORT, &mut parcel));
        assert_eq!(client.sent.lock().unwrap()[0].0, WireConfig::SHUTDOWN_TRANSPORT);
    }
}
