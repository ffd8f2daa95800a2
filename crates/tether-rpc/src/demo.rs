//! `refuse-demo`: an in-process server with a connection limit.
//!
//! The server endpoint runs a handler chain of an acceptor followed by a
//! connection-refusing handler. Clients beyond the limit get an immediate
//! `SHUTDOWN_TRANSPORT`; accepted clients make one echo call.

use anyhow::Result;
use bytes::Bytes;
use clap::Args;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tether_core::{
    ClientConnection, Code, ConnectionRefusingHandler, HandlerChain, LeakSafeEndpoint, LocalHandle, ServerAcceptor,
    ServerStream, ServerTransportListener, Status, StreamListener, SyncContext, TransactionHandler,
};
use tracing::{debug, info};

const ECHO_METHOD: &str = "tether.Echo/Say";

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Connections the acceptor takes before refusing
    #[arg(long, default_value = "1")]
    max_transports: usize,

    /// Number of clients to connect
    #[arg(long, default_value = "3")]
    clients: usize,

    /// Message each accepted client sends
    #[arg(long, default_value = "ping")]
    message: String,

    /// Refuse every connection
    #[arg(long)]
    refuse_all: bool,
}

#[derive(Debug, Serialize)]
struct ClientOutcome {
    client: usize,
    accepted: bool,
    echoed: Option<String>,
    status: Option<Status>,
}

struct EchoCall {
    stream: Weak<ServerStream>,
}

impl StreamListener for EchoCall {
    fn message_available(&self, message: Bytes) {
        if let Some(stream) = self.stream.upgrade() {
            stream.write_message(message);
        }
    }

    fn half_closed(&self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.close(Status::ok());
        }
    }

    fn closed(&self, status: Status) {
        debug!("Echo call finished: {}", status);
    }
}

struct EchoService;

impl ServerTransportListener for EchoService {
    fn transport_ready(&self) {
        info!("Server transport ready");
    }

    fn stream_created(&self, stream: Arc<ServerStream>) {
        if stream.method() != ECHO_METHOD {
            stream.close(Status::new(Code::Unimplemented).with_description(stream.method()));
            return;
        }
        stream.start(Arc::new(EchoCall {
            stream: Arc::downgrade(&stream),
        }));
        stream.request(usize::MAX);
    }

    fn transport_terminated(&self) {
        info!("Server transport terminated");
    }
}

#[derive(Default)]
struct CollectingCall {
    messages: Mutex<Vec<Bytes>>,
    status: Mutex<Option<Status>>,
}

impl StreamListener for CollectingCall {
    fn message_available(&self, message: Bytes) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }

    fn closed(&self, status: Status) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = Some(status);
        }
    }
}

fn server_chain(args: &DemoArgs) -> Arc<HandlerChain> {
    let mut chain = HandlerChain::new();
    if !args.refuse_all {
        let acceptor = ServerAcceptor::new(SyncContext::new(), |_transport| {
            Arc::new(EchoService) as Arc<dyn ServerTransportListener>
        })
        .with_max_transports(args.max_transports);
        chain.push(Arc::new(acceptor));
    }
    chain.push(Arc::new(ConnectionRefusingHandler));
    Arc::new(chain)
}

fn echo_once(connection: &ClientConnection, message: &str) -> Result<(Option<String>, Option<Status>)> {
    let stream = connection.new_stream(ECHO_METHOD)?;
    let call = Arc::new(CollectingCall::default());
    stream.request(1);
    stream.start(call.clone());
    stream.write_message(Bytes::copy_from_slice(message.as_bytes()));
    stream.half_close();

    let echoed = call
        .messages
        .lock()
        .ok()
        .and_then(|messages| messages.first().cloned())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    let status = call.status.lock().ok().and_then(|status| status.clone());
    Ok((echoed, status))
}

fn run_clients(args: &DemoArgs) -> Result<Vec<ClientOutcome>> {
    let chain = server_chain(args);
    let endpoint = LeakSafeEndpoint::new();
    endpoint.set_handler(Arc::downgrade(&chain) as Weak<dyn TransactionHandler>);
    let server = LocalHandle::new(endpoint);

    let mut outcomes = Vec::with_capacity(args.clients);
    let mut connections = Vec::new();
    for client in 0..args.clients {
        let connection = ClientConnection::connect(server.clone())?;
        let outcome = if connection.is_ready() {
            let (echoed, status) = echo_once(&connection, &args.message)?;
            ClientOutcome {
                client,
                accepted: true,
                echoed,
                status,
            }
        } else {
            ClientOutcome {
                client,
                accepted: false,
                echoed: None,
                status: connection.shutdown_status(),
            }
        };
        info!("Client {} accepted={}", client, outcome.accepted);
        outcomes.push(outcome);
        connections.push(connection);
    }

    for connection in &connections {
        connection.shutdown(Status::cancelled().with_description("demo finished"));
    }
    Ok(outcomes)
}

pub fn run(args: &DemoArgs) -> Result<()> {
    let outcomes = run_clients(args)?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_args(max_transports: usize, clients: usize, refuse_all: bool) -> DemoArgs {
        DemoArgs {
            max_transports,
            clients,
            message: "ping".to_string(),
            refuse_all,
        }
    }

    #[test]
    fn test_clients_past_limit_are_refused() {
        let outcomes = run_clients(&demo_args(2, 3, false)).unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].accepted);
        assert!(outcomes[1].accepted);
        assert!(!outcomes[2].accepted);
        assert_eq!(outcomes[0].echoed.as_deref(), Some("ping"));
        assert_eq!(outcomes[0].status.as_ref().map(|s| s.code()), Some(Code::Ok));
        assert_eq!(outcomes[2].status.as_ref().map(|s| s.code()), Some(Code::Unavailable));
    }

    #[test]
    fn test_refuse_all() {
        let outcomes = run_clients(&demo_args(8, 2, true)).unwrap();
        assert!(outcomes.iter().all(|o| !o.accepted));
    }
}
