//! Server side of one connection.
//!
//! # State machine
//!
//! ```text
//! NOT_STARTED -> STARTING -> ACTIVE -> SHUTTING_DOWN -> TERMINATED
//!      |             |                      ^
//!      +-------------+----------------------+
//! ```
//!
//! `shutdown_now` may race `start`, the peer's death and the peer's own
//! shutdown. The first caller takes `shutdown_claimed` with a
//! compare-exchange; everyone else returns without touching any state. The
//! winner's status is the one recorded, and termination is posted to the sync
//! context exactly once, as soon as a listener is known.

use super::{ServerTransportListener, TransportState};
use crate::address::Attributes;
use crate::config::{TransportConfig, WireConfig};
use crate::endpoint::{DeathRecipient, LeakSafeEndpoint, LocalHandle, OneWayHandle, OneWayProxy, TransactionHandler};
use crate::executor::SyncContext;
use crate::handshake::{shutdown_parcel, SetupRequest};
use crate::parcel::Parcel;
use crate::status::Status;
use crate::stream::{FrameOutbound, InboundState, Outbound, ServerStream, StreamOwner};
use crate::wire::{self, Frame, FLAG_PREFIX};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

struct TransportInner {
    state: TransportState,
    listener: Option<Arc<dyn ServerTransportListener>>,
    peer: Option<OneWayProxy>,
    shutdown_status: Option<Status>,
    streams: HashMap<u32, Arc<ServerStream>>,
    termination_posted: bool,
}

impl TransportInner {
    /// Claim the single termination post. Needs both a listener to tell and
    /// the winning shutdown status, so whichever side supplies the second
    /// one posts.
    fn claim_termination(&mut self) -> bool {
        if self.listener.is_none() || self.shutdown_status.is_none() || self.termination_posted {
            return false;
        }
        self.termination_posted = true;
        true
    }
}

/// Server side of one connection.
pub struct ServerTransport {
    self_ref: Weak<ServerTransport>,
    sync_context: SyncContext,
    endpoint: Arc<LeakSafeEndpoint>,
    own_handle: Arc<dyn OneWayHandle>,
    attributes: Attributes,
    shutdown_claimed: AtomicBool,
    inner: Mutex<TransportInner>,
}

impl ServerTransport {
    /// Create a transport receiving on `endpoint`, reachable by peers through
    /// `own_handle`. The transport installs itself as the endpoint's handler.
    pub fn new(
        sync_context: SyncContext,
        endpoint: Arc<LeakSafeEndpoint>,
        own_handle: Arc<dyn OneWayHandle>,
        attributes: Attributes,
    ) -> Arc<Self> {
        let transport = Arc::new_cyclic(|weak: &Weak<ServerTransport>| ServerTransport {
            self_ref: weak.clone(),
            sync_context,
            endpoint,
            own_handle,
            attributes,
            shutdown_claimed: AtomicBool::new(false),
            inner: Mutex::new(TransportInner {
                state: TransportState::NotStarted,
                listener: None,
                peer: None,
                shutdown_status: None,
                streams: HashMap::new(),
                termination_posted: false,
            }),
        });
        let handler = transport.self_ref.clone() as Weak<dyn TransactionHandler>;
        transport.endpoint.set_handler(handler);
        transport
    }

    /// Transport on a fresh in-process endpoint.
    pub fn local(sync_context: SyncContext) -> Arc<Self> {
        let endpoint = LeakSafeEndpoint::new();
        let own_handle = LocalHandle::new(endpoint.clone());
        Self::new(sync_context, endpoint, own_handle, Attributes::new())
    }

    fn lock(&self) -> MutexGuard<'_, TransportInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin the handshake with `peer`.
    ///
    /// If the transport was already shut down, only records the listener and
    /// completes termination. A failed death link or setup send shuts the
    /// transport down without it ever becoming active.
    pub fn start(&self, peer: Arc<dyn OneWayHandle>, listener: Arc<dyn ServerTransportListener>) {
        let proxy = OneWayProxy::new(peer.clone());
        {
            let mut inner = self.lock();
            if inner.listener.is_some() {
                warn!("Transport for handle {} started twice", peer.handle_id());
                return;
            }
            inner.listener = Some(listener.clone());
            if self.shutdown_claimed.load(Ordering::SeqCst) {
                let post = inner.claim_termination();
                drop(inner);
                debug!("Transport shut down before start");
                if post {
                    self.post_termination();
                }
                return;
            }
            inner.state = TransportState::Starting;
            inner.peer = Some(proxy.clone());
        }

        if self.shutdown_claimed.load(Ordering::SeqCst) {
            return;
        }
        let recipient = self.self_ref.clone() as Weak<dyn DeathRecipient>;
        if let Err(e) = peer.link_to_death(recipient) {
            warn!("Failed to link to death of handle {}: {}", peer.handle_id(), e);
            self.shutdown_now(
                Status::unavailable()
                    .with_description("Failed to link to peer death")
                    .with_cause(&e),
            );
            return;
        }

        let setup = SetupRequest::encode(self.own_handle.clone());
        if let Err(e) = proxy.send(WireConfig::SETUP_TRANSPORT, &setup) {
            warn!("Failed to send SETUP_TRANSPORT to handle {}: {}", peer.handle_id(), e);
            self.shutdown_now(
                Status::unavailable()
                    .with_description("Failed to send SETUP_TRANSPORT")
                    .with_cause(&e),
            );
            return;
        }

        {
            let mut inner = self.lock();
            if inner.state != TransportState::Starting || self.shutdown_claimed.load(Ordering::SeqCst) {
                return;
            }
            inner.state = TransportState::Active;
            // Queued under the lock, so a later termination post runs after it.
            self.sync_context.execute_later(move || listener.transport_ready());
        }
        info!("Transport to handle {} is active", peer.handle_id());
        self.sync_context.drain();
    }

    /// Shut the transport down with `status`. Only the first call has any effect.
    pub fn shutdown_now(&self, status: Status) {
        if self
            .shutdown_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring shutdown ({}): already shutting down", status);
            return;
        }

        let (peer, streams, post) = {
            let mut inner = self.lock();
            inner.shutdown_status = Some(status.clone());
            if inner.state < TransportState::ShuttingDown {
                inner.state = TransportState::ShuttingDown;
            }
            let streams: Vec<_> = inner.streams.drain().map(|(_, stream)| stream).collect();
            let post = inner.claim_termination();
            (inner.peer.take(), streams, post)
        };
        info!("Shutting down transport: {}", status);

        if let Some(peer) = peer {
            if let Err(e) = peer.send(WireConfig::SHUTDOWN_TRANSPORT, &shutdown_parcel()) {
                debug!("Best-effort SHUTDOWN_TRANSPORT failed: {}", e);
            }
            let recipient = self.self_ref.clone() as Weak<dyn DeathRecipient>;
            peer.handle().unlink_to_death(&recipient);
        }
        for stream in streams {
            stream.abort(status.clone());
        }
        self.endpoint.detach();

        if post {
            self.post_termination();
        }
    }

    fn post_termination(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.sync_context.execute(move || this.terminate());
    }

    fn terminate(&self) {
        let listener = {
            let mut inner = self.lock();
            inner.state = TransportState::Terminated;
            inner.listener.take()
        };
        debug!("Transport terminated");
        if let Some(listener) = listener {
            listener.transport_terminated();
        }
    }

    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    /// Status of the winning shutdown, if any.
    pub fn shutdown_status(&self) -> Option<Status> {
        self.lock().shutdown_status.clone()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Handle peers use to reach this transport.
    pub fn own_handle(&self) -> &Arc<dyn OneWayHandle> {
        &self.own_handle
    }

    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    fn handle_frame(&self, call_id: u32, parcel: &mut Parcel) -> bool {
        let frame = match Frame::from_parcel(parcel) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame for call {}: {}", call_id, e);
                return true;
            }
        };

        enum Route {
            Existing(Arc<ServerStream>),
            Created(Arc<ServerStream>, Arc<dyn ServerTransportListener>),
            Refused(OneWayProxy),
        }

        let route = {
            let mut inner = self.lock();
            if inner.state != TransportState::Active {
                debug!("Dropping frame for call {} in state {}", call_id, inner.state);
                return true;
            }
            if let Some(stream) = inner.streams.get(&call_id) {
                Route::Existing(stream.clone())
            } else if !frame.has(FLAG_PREFIX) {
                debug!("Dropping frame for unknown call {}", call_id);
                return true;
            } else {
                let (Some(peer), Some(listener)) = (inner.peer.clone(), inner.listener.clone()) else {
                    return true;
                };
                if inner.streams.len() >= TransportConfig::MAX_STREAMS_PER_TRANSPORT {
                    Route::Refused(peer)
                } else {
                    let method = String::from_utf8_lossy(&frame.payload).into_owned();
                    let owner = self.self_ref.clone() as Weak<dyn StreamOwner>;
                    let stream = Arc::new(ServerStream::new(
                        call_id,
                        method,
                        InboundState::new(call_id, Some(owner)),
                        FrameOutbound::new(call_id, peer, None),
                    ));
                    inner.streams.insert(call_id, stream.clone());
                    Route::Created(stream, listener)
                }
            }
        };

        match route {
            Route::Existing(stream) => stream.on_frame(frame),
            Route::Created(stream, listener) => {
                debug!("Call {} opened for {}", call_id, stream.method());
                stream.on_frame(frame);
                self.sync_context.execute(move || listener.stream_created(stream));
            }
            Route::Refused(peer) => {
                warn!("Refusing call {}: stream limit reached", call_id);
                let status = Status::unavailable().with_description("Too many concurrent streams");
                if let Err(e) = FrameOutbound::new(call_id, peer, None).send_close(&status) {
                    debug!("Failed to refuse call {}: {}", call_id, e);
                }
            }
        }
        true
    }

    fn handle_ping(&self, parcel: &mut Parcel) {
        let Ok(id) = parcel.read_u32() else {
            return;
        };
        let peer = self.lock().peer.clone();
        if let Some(peer) = peer {
            let mut reply = Parcel::new();
            reply.write_u32(id);
            if let Err(e) = peer.send(WireConfig::PING_RESPONSE, &reply) {
                debug!("Failed to answer ping {}: {}", id, e);
            }
        }
    }
}

impl TransactionHandler for ServerTransport {
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool {
        match code {
            WireConfig::SHUTDOWN_TRANSPORT => {
                self.shutdown_now(Status::unavailable().with_description("Peer sent SHUTDOWN_TRANSPORT"));
                true
            }
            WireConfig::PING => {
                self.handle_ping(parcel);
                true
            }
            _ => match wire::call_id(code) {
                Some(call_id) => self.handle_frame(call_id, parcel),
                None => false,
            },
        }
    }
}

impl DeathRecipient for ServerTransport {
    fn binder_died(&self) {
        self.shutdown_now(Status::unavailable().with_description("Peer process died"));
    }
}

impl StreamOwner for ServerTransport {
    fn stream_closed(&self, call_id: u32) {
        self.lock().streams.remove(&call_id);
    }
}
