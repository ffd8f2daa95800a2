//! Tether Core - one-way IPC RPC transport and endpoint discovery.
//!
//! This crate provides the pieces of an RPC transport built on a
//! fire-and-forget interprocess call primitive:
//!
//! - the connection handshake and teardown state machine ([`transport`]),
//!   including a handler that refuses connections outright ([`handshake`]);
//! - streams that map RPC messages onto a connection with a single failure
//!   path ([`stream`]);
//! - a resolver that turns an `intent:` target into a live list of server
//!   addresses from a service directory ([`resolver`], [`directory`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{
//!     CapabilityFilter, ComponentName, IntentResolverProvider, ResolverArgs,
//!     ResolverProvider, SqliteDirectory, SyncContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let directory = Arc::new(SqliteDirectory::open()?);
//!     directory.install(
//!         &ComponentName::new("com.example", "com.example.EchoService"),
//!         &CapabilityFilter::new().with_action("com.example.ECHO"),
//!     )?;
//!
//!     let provider = IntentResolverProvider::for_directory(directory);
//!     let args = ResolverArgs::new(SyncContext::new(), tokio::runtime::Handle::current());
//!     let resolver = provider
//!         .new_resolver("intent:#Intent;action=com.example.ECHO;end", &args)
//!         .expect("intent scheme");
//!     resolver.start(listener)?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod descriptor;
pub mod directory;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod parcel;
pub mod platform;
pub mod resolver;
pub mod status;
pub mod stream;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use address::{AddressGroup, Attributes, ComponentAddress};
pub use descriptor::{ComponentName, Descriptor, Extra};
pub use directory::{
    CapabilityFilter, ChangeEvent, ChangeFilter, ChangeKind, ChangeReceiver, ChangeRegistry,
    ProviderInfo, ServiceDirectory, SqliteDirectory, Subscription,
};
pub use endpoint::{
    DeathRecipient, LeakSafeEndpoint, LocalHandle, OneWayHandle, OneWayProxy, TransactionHandler,
};
pub use error::{Result, TetherError};
pub use executor::{SequentialExecutor, SyncContext};
pub use handshake::{ConnectionRefusingHandler, HandlerChain};
pub use parcel::Parcel;
pub use resolver::{
    IntentResolver, IntentResolverProvider, Resolution, ResolutionResult, Resolver, ResolverArgs,
    ResolverListener, ResolverProvider, ResolverRegistry, ServiceConfig,
};
pub use status::{Code, Status};
pub use stream::{ClientStream, ServerStream, StreamListener};
pub use transport::{
    ClientConnection, ServerAcceptor, ServerTransport, ServerTransportListener, TransportState,
};
