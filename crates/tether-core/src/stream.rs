//! Stream engine: one RPC's messages mapped onto a connection.
//!
//! A stream pairs an [`Outbound`] strategy (framing and sending) with an
//! [`Inbound`] strategy (receiving and closing). The stream types in this
//! module own the failure path: an error raised by the outbound side during
//! `start`, `write_message`, `half_close` or `close` never reaches the caller.
//! It is converted into one `close_abnormal` on the inbound side instead, and
//! the inbound side ignores every close after the first.

use crate::address::Attributes;
use crate::endpoint::OneWayProxy;
use crate::status::Status;
use crate::wire::{self, Frame, FLAG_CLOSE, FLAG_HALF_CLOSE, FLAG_MESSAGE_DATA, FLAG_PREFIX};
use crate::{Result, TetherError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Receives a stream's inbound events.
pub trait StreamListener: Send + Sync {
    fn message_available(&self, message: Bytes);

    /// The peer will send no more messages.
    fn half_closed(&self) {}

    /// Terminal status. Called exactly once per stream.
    fn closed(&self, status: Status);
}

/// Outbound half of a stream.
///
/// Implementations report faults as `Err` and never panic; only an `Err`
/// is turned into the stream's abnormal close.
pub trait Outbound: Send + Sync {
    /// The stream is armed; send the buffered prefix and anything queued behind it.
    fn on_prefix_ready(&self) -> Result<()>;
    fn add_message(&self, message: Bytes) -> Result<()>;
    fn send_half_close(&self) -> Result<()>;
    fn send_close(&self, status: &Status) -> Result<()>;
    fn is_ready(&self) -> bool {
        true
    }
}

/// Inbound half of a stream.
pub trait Inbound: Send + Sync {
    fn init(&self, listener: Arc<dyn StreamListener>);
    fn request_messages(&self, count: usize);
    /// Close because something went wrong locally. Repeated calls are ignored.
    fn close_abnormal(&self, status: Status);
    /// Close because the application cancelled.
    fn close_on_cancel(&self, status: Status);
}

/// Told when a stream reaches its terminal state so the connection can forget it.
pub trait StreamOwner: Send + Sync {
    fn stream_closed(&self, call_id: u32);
}

/// Route an outbound failure into the stream's single close path.
fn fail_stream(call_id: u32, inbound: &dyn Inbound, operation: &str, err: TetherError) {
    warn!("Stream {} failed during {}: {}", call_id, operation, err);
    inbound.close_abnormal(Status::from_error(&err));
}

/// Client side of one RPC.
pub struct ClientStream {
    call_id: u32,
    inbound: Arc<dyn Inbound>,
    outbound: Arc<dyn Outbound>,
    attributes: Attributes,
}

impl ClientStream {
    pub fn new(call_id: u32, inbound: Arc<dyn Inbound>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            call_id,
            inbound,
            outbound,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Attributes of the transport carrying this stream.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Arm the stream and flush the prefix.
    pub fn start(&self, listener: Arc<dyn StreamListener>) {
        self.inbound.init(listener);
        if let Err(e) = self.outbound.on_prefix_ready() {
            fail_stream(self.call_id, &*self.inbound, "start", e);
        }
    }

    pub fn write_message(&self, message: impl Into<Bytes>) {
        if let Err(e) = self.outbound.add_message(message.into()) {
            fail_stream(self.call_id, &*self.inbound, "write_message", e);
        }
    }

    pub fn half_close(&self) {
        if let Err(e) = self.outbound.send_half_close() {
            fail_stream(self.call_id, &*self.inbound, "half_close", e);
        }
    }

    pub fn request(&self, count: usize) {
        self.inbound.request_messages(count);
    }

    pub fn cancel(&self, status: Status) {
        self.inbound.close_on_cancel(status);
    }

    pub fn is_ready(&self) -> bool {
        self.outbound.is_ready()
    }
}

/// Server side of one RPC, created by the transport on the first frame.
pub struct ServerStream {
    call_id: u32,
    method: String,
    inbound: Arc<InboundState>,
    outbound: Arc<dyn Outbound>,
}

impl ServerStream {
    pub fn new(
        call_id: u32,
        method: String,
        inbound: Arc<InboundState>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            call_id,
            method,
            inbound,
            outbound,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Method name from the client's prefix frame.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn start(&self, listener: Arc<dyn StreamListener>) {
        self.inbound.init(listener);
    }

    pub fn request(&self, count: usize) {
        self.inbound.request_messages(count);
    }

    pub fn write_message(&self, message: impl Into<Bytes>) {
        if let Err(e) = self.outbound.add_message(message.into()) {
            fail_stream(self.call_id, &*self.inbound, "write_message", e);
        }
    }

    /// Send the final status to the client and close locally.
    pub fn close(&self, status: Status) {
        match self.outbound.send_close(&status) {
            Ok(()) => self.inbound.close(status),
            Err(e) => fail_stream(self.call_id, &*self.inbound, "close", e),
        }
    }

    /// Close without telling the peer; used when the transport goes away.
    pub fn abort(&self, status: Status) {
        self.inbound.close_abnormal(status);
    }

    /// Feed one inbound frame.
    pub fn on_frame(&self, frame: Frame) {
        self.inbound.on_frame(frame);
    }

    pub fn terminal_status(&self) -> Option<Status> {
        self.inbound.terminal_status()
    }
}

#[derive(Default)]
struct InboundInner {
    listener: Option<Arc<dyn StreamListener>>,
    pending: VecDeque<Bytes>,
    requested: usize,
    peer_half_closed: bool,
    half_close_delivered: bool,
    terminal: Option<Status>,
    close_delivered: bool,
    delivering: bool,
}

/// Connection-side inbound state of one stream.
///
/// Buffers messages until the listener asks for them and holds the stream's
/// terminal status: the first close wins and is delivered exactly once.
pub struct InboundState {
    call_id: u32,
    owner: Option<Weak<dyn StreamOwner>>,
    inner: Mutex<InboundInner>,
}

impl InboundState {
    pub fn new(call_id: u32, owner: Option<Weak<dyn StreamOwner>>) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            owner,
            inner: Mutex::new(InboundInner::default()),
        })
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Apply one frame received from the peer.
    pub fn on_frame(&self, frame: Frame) {
        if frame.has(FLAG_CLOSE) {
            match frame.close_status() {
                Ok(status) => self.close(status),
                Err(e) => self.close_abnormal(Status::from_error(&e)),
            }
            return;
        }
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.terminal.is_some() {
                debug!("Stream {} dropping frame after close", self.call_id);
                return;
            }
            if frame.has(FLAG_MESSAGE_DATA) {
                inner.pending.push_back(frame.payload.clone());
            }
            if frame.has(FLAG_HALF_CLOSE) {
                inner.peer_half_closed = true;
            }
        }
        self.deliver();
    }

    /// Record the terminal status. Later calls are ignored.
    pub fn close(&self, status: Status) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.terminal.is_some() {
                debug!("Stream {} already closed, ignoring {}", self.call_id, status);
                return;
            }
            if !status.is_ok() {
                inner.pending.clear();
            }
            inner.terminal = Some(status);
        }
        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.stream_closed(self.call_id);
        }
        self.deliver();
    }

    pub fn terminal_status(&self) -> Option<Status> {
        self.inner.lock().ok().and_then(|inner| inner.terminal.clone())
    }

    /// Drain whatever the listener may receive now. Callbacks run without the
    /// lock held; a second caller arriving mid-drain leaves the work to the first.
    fn deliver(&self) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.delivering || inner.listener.is_none() {
                return;
            }
            inner.delivering = true;
        }
        loop {
            enum Next {
                Message(Arc<dyn StreamListener>, Bytes),
                HalfClose(Arc<dyn StreamListener>),
                Close(Arc<dyn StreamListener>, Status),
            }

            let next = {
                let Ok(mut inner) = self.inner.lock() else {
                    return;
                };
                let Some(listener) = inner.listener.clone() else {
                    inner.delivering = false;
                    return;
                };
                if inner.requested > 0 && !inner.pending.is_empty() {
                    inner.requested -= 1;
                    let message = inner.pending.pop_front().unwrap_or_default();
                    Next::Message(listener, message)
                } else if inner.pending.is_empty()
                    && inner.peer_half_closed
                    && !inner.half_close_delivered
                    && inner.terminal.is_none()
                {
                    inner.half_close_delivered = true;
                    Next::HalfClose(listener)
                } else if inner.pending.is_empty()
                    && !inner.close_delivered
                    && inner.terminal.is_some()
                {
                    inner.close_delivered = true;
                    let status = inner.terminal.clone().unwrap_or_else(Status::ok);
                    Next::Close(listener, status)
                } else {
                    // Must be cleared under the lock that found no work.
                    inner.delivering = false;
                    return;
                }
            };

            match next {
                Next::Message(listener, message) => listener.message_available(message),
                Next::HalfClose(listener) => listener.half_closed(),
                Next::Close(listener, status) => listener.closed(status),
            }
        }
    }
}

impl Inbound for InboundState {
    fn init(&self, listener: Arc<dyn StreamListener>) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.listener.is_some() {
                warn!("Stream {} started twice", self.call_id);
                return;
            }
            inner.listener = Some(listener);
        }
        self.deliver();
    }

    fn request_messages(&self, count: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.requested = inner.requested.saturating_add(count);
        }
        self.deliver();
    }

    fn close_abnormal(&self, status: Status) {
        self.close(status);
    }

    fn close_on_cancel(&self, status: Status) {
        self.close(status);
    }
}

#[derive(Default)]
struct OutboundInner {
    next_sequence: u32,
    prefix: Option<Bytes>,
    prefix_sent: bool,
    queued: Vec<Bytes>,
    half_closed: bool,
    closed: bool,
}

/// Frames outbound traffic into one-way transactions on a peer handle.
///
/// Frames are numbered under the lock and sent after it is released, so a
/// local peer may call straight back into this stream.
pub struct FrameOutbound {
    call_id: u32,
    peer: OneWayProxy,
    inner: Mutex<OutboundInner>,
}

impl FrameOutbound {
    /// `prefix` is sent first when the stream starts; server streams pass `None`.
    pub fn new(call_id: u32, peer: OneWayProxy, prefix: Option<Bytes>) -> Arc<Self> {
        let prefix_sent = prefix.is_none();
        Arc::new(Self {
            call_id,
            peer,
            inner: Mutex::new(OutboundInner {
                prefix,
                prefix_sent,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, OutboundInner>> {
        self.inner
            .lock()
            .map_err(|_| TetherError::Other(format!("stream {} outbound lock poisoned", self.call_id)))
    }

    fn send_frames(&self, frames: Vec<Frame>) -> Result<()> {
        let code = wire::call_code(self.call_id);
        for frame in frames {
            self.peer.send(code, &frame.to_parcel()?)?;
        }
        Ok(())
    }
}

fn next_frame(inner: &mut OutboundInner, flags: u32, payload: Bytes) -> Frame {
    let frame = Frame::new(flags, inner.next_sequence, payload);
    inner.next_sequence = inner.next_sequence.wrapping_add(1);
    frame
}

impl Outbound for FrameOutbound {
    fn on_prefix_ready(&self) -> Result<()> {
        let frames = {
            let mut inner = self.lock()?;
            if inner.prefix_sent {
                return Ok(());
            }
            inner.prefix_sent = true;
            let prefix = inner.prefix.take().unwrap_or_default();
            let mut frames = vec![next_frame(&mut inner, FLAG_PREFIX, prefix)];
            for message in std::mem::take(&mut inner.queued) {
                frames.push(next_frame(&mut inner, FLAG_MESSAGE_DATA, message));
            }
            if inner.half_closed {
                frames.push(next_frame(&mut inner, FLAG_HALF_CLOSE, Bytes::new()));
            }
            frames
        };
        self.send_frames(frames)
    }

    fn add_message(&self, message: Bytes) -> Result<()> {
        let frame = {
            let mut inner = self.lock()?;
            if inner.half_closed || inner.closed {
                return Err(TetherError::IllegalState(format!(
                    "stream {} write after half-close",
                    self.call_id
                )));
            }
            if !inner.prefix_sent {
                inner.queued.push(message);
                return Ok(());
            }
            next_frame(&mut inner, FLAG_MESSAGE_DATA, message)
        };
        self.send_frames(vec![frame])
    }

    fn send_half_close(&self) -> Result<()> {
        let frame = {
            let mut inner = self.lock()?;
            if inner.half_closed {
                return Ok(());
            }
            inner.half_closed = true;
            if !inner.prefix_sent {
                return Ok(());
            }
            next_frame(&mut inner, FLAG_HALF_CLOSE, Bytes::new())
        };
        self.send_frames(vec![frame])
    }

    fn send_close(&self, status: &Status) -> Result<()> {
        let frame = {
            let mut inner = self.lock()?;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            let sequence = inner.next_sequence;
            inner.next_sequence = sequence.wrapping_add(1);
            Frame::close(sequence, status)
        };
        self.send_frames(vec![frame])
    }

    fn is_ready(&self) -> bool {
        self.peer.handle().is_alive()
    }
}
