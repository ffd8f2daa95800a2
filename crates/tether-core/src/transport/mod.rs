//! Connection lifecycle over the one-way primitive.
//!
//! - [`ServerTransport`]: server side of one connection and its state machine.
//! - [`ServerAcceptor`]: turns setup requests on a well-known endpoint into
//!   server transports, up to a capacity.
//! - [`ClientConnection`]: minimal client side used to open streams.

mod acceptor;
mod client;
mod server;

pub use acceptor::ServerAcceptor;
pub use client::ClientConnection;
pub use server::ServerTransport;

use crate::status::{Code, Status};
use crate::stream::ServerStream;
use std::sync::Arc;

/// Connection states, in the only order they can be entered.
///
/// `Starting` and `Active` may be skipped: a failed handshake or an early
/// shutdown goes straight to `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportState {
    NotStarted,
    Starting,
    Active,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::NotStarted => write!(f, "NOT_STARTED"),
            TransportState::Starting => write!(f, "STARTING"),
            TransportState::Active => write!(f, "ACTIVE"),
            TransportState::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            TransportState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Lifecycle callbacks of a server transport, run on its sync context.
pub trait ServerTransportListener: Send + Sync {
    /// Handshake completed; the transport is active.
    fn transport_ready(&self) {}

    /// A client opened a stream. The default refuses it.
    fn stream_created(&self, stream: Arc<ServerStream>) {
        stream.close(
            Status::new(Code::Unimplemented)
                .with_description(format!("No handler for {}", stream.method())),
        );
    }

    /// Called exactly once, after the transport has terminated.
    fn transport_terminated(&self);
}
