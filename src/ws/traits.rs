//! Seams between the connection task and the raw message socket.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::types::{CloseEvent, Payload};

/// Notification produced by an open socket.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// An inbound data frame
    Message(Payload),
    /// A transport error. Informational; a [`SocketEvent::Close`] is expected to follow.
    Error(String),
    /// The socket closed. No further events are read after this one.
    Close(CloseEvent),
}

/// Write half of an open socket.
#[async_trait]
pub trait SocketWriter: Send + 'static {
    /// Write a payload as a single frame.
    async fn send(&mut self, payload: Payload) -> crate::Result<()>;

    /// Start the closing handshake with the given code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> crate::Result<()>;
}

/// An opened socket: its write half and the stream of its notifications.
///
/// A stream that ends without yielding [`SocketEvent::Close`] is treated as an
/// abnormal closure.
pub struct Socket {
    pub writer: Box<dyn SocketWriter>,
    pub events: BoxStream<'static, SocketEvent>,
}

impl Socket {
    #[must_use]
    pub fn new<W: SocketWriter>(writer: W, events: BoxStream<'static, SocketEvent>) -> Self {
        Self {
            writer: Box::new(writer),
            events,
        }
    }
}

/// Opens raw sockets. Resolving the future is the socket's "open" notification;
/// an error is its "error before open" notification.
///
/// # Example
///
/// ```ignore
/// struct Loopback;
///
/// #[async_trait]
/// impl Connector for Loopback {
///     async fn connect(&self, address: &str) -> resilient_ws::Result<Socket> {
///         let (writer, events) = loopback::pair(address);
///         Ok(Socket::new(writer, events))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> crate::Result<Socket>;
}

/// Receives the notifications of the socket that is currently live.
pub(crate) trait SocketListener {
    fn on_open(&mut self, socket: Socket);

    fn on_message(&mut self, payload: Payload);

    fn on_error(&mut self, error: &str);

    fn on_close(&mut self, event: CloseEvent);

    fn dispatch(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Message(payload) => self.on_message(payload),
            SocketEvent::Error(error) => self.on_error(&error),
            SocketEvent::Close(close) => self.on_close(close),
        }
    }
}
