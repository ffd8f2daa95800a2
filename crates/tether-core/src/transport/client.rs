//! Client side of a connection.

use crate::address::Attributes;
use crate::config::WireConfig;
use crate::endpoint::{LeakSafeEndpoint, LocalHandle, OneWayHandle, OneWayProxy, TransactionHandler};
use crate::handshake::{shutdown_parcel, SetupRequest};
use crate::parcel::Parcel;
use crate::status::Status;
use crate::stream::{ClientStream, FrameOutbound, Inbound, InboundState, StreamOwner};
use crate::wire::{self, Frame};
use crate::{Result, TetherError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

#[derive(Default)]
struct ClientInner {
    peer: Option<OneWayProxy>,
    shutdown_status: Option<Status>,
    streams: HashMap<u32, Arc<InboundState>>,
    next_call_id: u32,
}

/// Client side of one connection: sends the setup, learns the server
/// transport's handle from its reply and carries client streams.
pub struct ClientConnection {
    self_ref: Weak<ClientConnection>,
    endpoint: Arc<LeakSafeEndpoint>,
    own_handle: Arc<LocalHandle>,
    attributes: Attributes,
    inner: Mutex<ClientInner>,
}

impl ClientConnection {
    /// Send `SETUP_TRANSPORT` to a server's well-known handle.
    ///
    /// Returns once the setup is enqueued. With an in-process server the reply
    /// (setup or refusal) has usually arrived by then; check [`is_ready`].
    ///
    /// [`is_ready`]: ClientConnection::is_ready
    pub fn connect(server: Arc<dyn OneWayHandle>) -> Result<Arc<Self>> {
        let endpoint = LeakSafeEndpoint::new();
        let own_handle = LocalHandle::new(endpoint.clone());
        let mut attributes = Attributes::new();
        attributes.insert("server_handle".to_string(), server.handle_id().to_string());

        let connection = Arc::new_cyclic(|weak: &Weak<ClientConnection>| ClientConnection {
            self_ref: weak.clone(),
            endpoint,
            own_handle,
            attributes,
            inner: Mutex::new(ClientInner::default()),
        });
        let handler = connection.self_ref.clone() as Weak<dyn TransactionHandler>;
        connection.endpoint.set_handler(handler);

        let setup = SetupRequest::encode(connection.own_handle.clone());
        OneWayProxy::new(server).send(WireConfig::SETUP_TRANSPORT, &setup)?;
        Ok(connection)
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Whether the server accepted and the connection is still up.
    pub fn is_ready(&self) -> bool {
        let inner = self.lock();
        inner.peer.is_some() && inner.shutdown_status.is_none()
    }

    pub fn shutdown_status(&self) -> Option<Status> {
        self.lock().shutdown_status.clone()
    }

    /// Handle the server uses to reach this client.
    pub fn own_handle(&self) -> &Arc<LocalHandle> {
        &self.own_handle
    }

    /// Open a stream for `method`. Nothing is sent until the stream starts.
    pub fn new_stream(&self, method: &str) -> Result<ClientStream> {
        let mut inner = self.lock();
        if let Some(status) = &inner.shutdown_status {
            return Err(TetherError::IllegalState(format!("connection is shut down: {}", status)));
        }
        let peer = inner
            .peer
            .clone()
            .ok_or_else(|| TetherError::IllegalState("connection is not ready".to_string()))?;

        let call_id = inner.next_call_id;
        inner.next_call_id = inner.next_call_id.wrapping_add(1);
        let owner = self.self_ref.clone() as Weak<dyn StreamOwner>;
        let inbound = InboundState::new(call_id, Some(owner));
        inner.streams.insert(call_id, inbound.clone());

        let outbound = FrameOutbound::new(call_id, peer, Some(Bytes::copy_from_slice(method.as_bytes())));
        Ok(ClientStream::new(call_id, inbound, outbound).with_attributes(self.attributes.clone()))
    }

    /// Tell the server we are leaving and fail open streams.
    pub fn shutdown(&self, status: Status) {
        let Some(peer) = self.close_locally(status) else {
            return;
        };
        if let Err(e) = peer.send(WireConfig::SHUTDOWN_TRANSPORT, &shutdown_parcel()) {
            debug!("Best-effort SHUTDOWN_TRANSPORT failed: {}", e);
        }
    }

    /// Record the shutdown and abort streams. Returns the peer if this call
    /// did the shutting down.
    fn close_locally(&self, status: Status) -> Option<OneWayProxy> {
        let (peer, streams) = {
            let mut inner = self.lock();
            if inner.shutdown_status.is_some() {
                return None;
            }
            inner.shutdown_status = Some(status.clone());
            let streams: Vec<_> = inner.streams.drain().map(|(_, stream)| stream).collect();
            (inner.peer.take(), streams)
        };
        info!("Client connection closed: {}", status);
        for stream in streams {
            stream.close_abnormal(status.clone());
        }
        self.endpoint.detach();
        peer
    }
}

impl TransactionHandler for ClientConnection {
    fn handle_transaction(&self, code: u32, parcel: &mut Parcel) -> bool {
        match code {
            WireConfig::SETUP_TRANSPORT => {
                let Some(setup) = SetupRequest::parse(code, parcel) else {
                    warn!("Malformed SETUP_TRANSPORT reply");
                    return false;
                };
                let mut inner = self.lock();
                if inner.shutdown_status.is_none() {
                    debug!("Server transport is handle {}", setup.peer.handle_id());
                    inner.peer = Some(OneWayProxy::new(setup.peer));
                }
                true
            }
            WireConfig::SHUTDOWN_TRANSPORT => {
                self.close_locally(Status::unavailable().with_description("Server sent SHUTDOWN_TRANSPORT"));
                true
            }
            WireConfig::PING_RESPONSE => true,
            _ => {
                let Some(call_id) = wire::call_id(code) else {
                    return false;
                };
                let stream = self.lock().streams.get(&call_id).cloned();
                match (stream, Frame::from_parcel(parcel)) {
                    (Some(stream), Ok(frame)) => stream.on_frame(frame),
                    (Some(stream), Err(e)) => stream.close_abnormal(Status::from_error(&e)),
                    (None, _) => debug!("Dropping frame for unknown call {}", call_id),
                }
                true
            }
        }
    }
}

impl StreamOwner for ClientConnection {
    fn stream_closed(&self, call_id: u32) {
        self.lock().streams.remove(&call_id);
    }
}
