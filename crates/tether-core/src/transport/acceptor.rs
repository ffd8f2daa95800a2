//! Accepts connections on a server's well-known endpoint.

use super::{ServerTransport, ServerTransportListener, TransportState};
use crate::config::TransportConfig;
use crate::endpoint::TransactionHandler;
use crate::executor::SyncContext;
use crate::handshake::SetupRequest;
use crate::parcel::Parcel;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type ListenerFactory = dyn Fn(&Arc<ServerTransport>) -> Arc<dyn ServerTransportListener> + Send + Sync;

/// Creates a [`ServerTransport`] for every valid setup request.
///
/// At capacity it declines the setup, so a [`HandlerChain`] with a
/// [`ConnectionRefusingHandler`] behind it turns the overflow into an explicit
/// refusal.
///
/// [`HandlerChain`]: crate::handshake::HandlerChain
/// [`ConnectionRefusingHandler`]: crate::handshake::ConnectionRefusingHandler
pub struct ServerAcceptor {
    sync_context: SyncContext,
    listener_factory: Box<ListenerFactory>,
    max_transports: usize,
    transports: Mutex<Vec<Arc<ServerTransport>>>,
}

impl ServerAcceptor {
    pub fn new<F>(sync_context: SyncContext, listener_factory: F) -> Self
    where
        F: Fn(&Arc<ServerTransport>) -> Arc<dyn ServerTransportListener> + Send + Sync + 'static,
    {
        Self {
            sync_context,
            listener_factory: Box::new(listener_factory),
            max_transports: TransportConfig::DEFAULT_MAX_TRANSPORTS,
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_transports(mut self, max_transports: usize) -> Self {
        self.max_transports = max_transports;
        self
    }

    /// Transports that have not terminated yet.
    pub fn live_transports(&self) -> Vec<Arc<ServerTransport>> {
        let Ok(mut transports) = self.transports.lock() else {
            return Vec::new();
        };
        transports.retain(|t| t.state() != TransportState::Terminated);
        transports.clone()
    }
}

impl TransactionHandler for ServerAcceptor {
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool {
        let Some(setup) = SetupRequest::parse(code, parcel) else {
            return false;
        };

        let transport = {
            let Ok(mut transports) = self.transports.lock() else {
                return false;
            };
            transports.retain(|t| t.state() != TransportState::Terminated);
            if transports.len() >= self.max_transports {
                debug!(
                    "Declining setup from handle {}: at max capacity ({})",
                    setup.peer.handle_id(),
                    self.max_transports
                );
                return false;
            }
            let transport = ServerTransport::local(self.sync_context.clone());
            transports.push(transport.clone());
            transport
        };
        info!("Accepted connection from handle {}", setup.peer.handle_id());

        let listener = (self.listener_factory)(&transport);
        transport.start(setup.peer, listener);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireConfig;
    use crate::endpoint::{LeakSafeEndpoint, LocalHandle};
    use std::sync::Barrier;

    struct QuietService;

    impl ServerTransportListener for QuietService {
        fn transport_terminated(&self) {}
    }

    #[test]
    fn test_concurrent_setups_respect_capacity() {
        for _ in 0..20 {
            let acceptor = Arc::new(
                ServerAcceptor::new(SyncContext::new(), |_transport| {
                    Arc::new(QuietService) as Arc<dyn ServerTransportListener>
                })
                .with_max_transports(2),
            );
            let barrier = Arc::new(Barrier::new(6));

            let handles: Vec<_> = (0..6)
                .map(|_| {
                    let acceptor = acceptor.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let client = LocalHandle::new(LeakSafeEndpoint::new());
                        let mut setup = SetupRequest::encode(client);
                        barrier.wait();
                        acceptor.handle_transaction(WireConfig::SETUP_TRANSPORT, &mut setup)
                    })
                })
                .collect();
            let accepted = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|accepted| *accepted)
                .count();

            assert_eq!(accepted, 2);
            assert_eq!(acceptor.live_transports().len(), 2);
        }
    }
}
