//! User-supplied callbacks invoked by the connection task.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::types::{CloseEvent, Epoch, Payload, StopReason};

type MessageFn = dyn Fn(Payload) + Send + Sync;
type ReconnectSuccessFn = dyn Fn(Epoch) + Send + Sync;
type ReconnectStoppedFn = dyn Fn(StopReason, &CloseEvent) + Send + Sync;
type ShouldReconnectFn = dyn Fn(&CloseEvent) -> bool + Send + Sync;
type HeartbeatFn = dyn Fn() -> Option<Payload> + Send + Sync;

const DEFAULT_HEARTBEAT_PAYLOAD: &str = "ping";

/// Callbacks registered with a [`ConnectionManager`](super::ConnectionManager).
///
/// A panic inside any callback is caught and logged; it never reaches the
/// connection task.
///
/// ```
/// use resilient_ws::ws::{Handlers, Payload};
///
/// let handlers = Handlers::default()
///     .on_message(|payload| println!("{payload:?}"))
///     .should_reconnect(|close| close.code != 4000)
///     .heartbeat_payload(|| Some(Payload::from(r#"{"type":"ping"}"#)));
/// ```
#[derive(Clone)]
pub struct Handlers {
    pub(crate) on_message: Arc<MessageFn>,
    pub(crate) on_reconnect_success: Option<Arc<ReconnectSuccessFn>>,
    pub(crate) on_reconnect_stopped: Option<Arc<ReconnectStoppedFn>>,
    pub(crate) should_reconnect: Arc<ShouldReconnectFn>,
    pub(crate) heartbeat_payload: Arc<HeartbeatFn>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_message: Arc::new(|_| {}),
            on_reconnect_success: None,
            on_reconnect_stopped: None,
            should_reconnect: Arc::new(|_| true),
            heartbeat_payload: Arc::new(|| Some(Payload::from(DEFAULT_HEARTBEAT_PAYLOAD))),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_reconnect_success", &self.on_reconnect_success.is_some())
            .field("on_reconnect_stopped", &self.on_reconnect_stopped.is_some())
            .finish_non_exhaustive()
    }
}

impl Handlers {
    /// Called with every inbound data frame, in transport order.
    #[must_use]
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.on_message = Arc::new(f);
        self
    }

    /// Called after an automatic reconnection attempt opened a new socket.
    #[must_use]
    pub fn on_reconnect_success<F>(mut self, f: F) -> Self
    where
        F: Fn(Epoch) + Send + Sync + 'static,
    {
        self.on_reconnect_success = Some(Arc::new(f));
        self
    }

    /// Called once when automatic reconnection gives up.
    #[must_use]
    pub fn on_reconnect_stopped<F>(mut self, f: F) -> Self
    where
        F: Fn(StopReason, &CloseEvent) + Send + Sync + 'static,
    {
        self.on_reconnect_stopped = Some(Arc::new(f));
        self
    }

    /// Decides, for each unexpected close, whether reconnection may continue.
    #[must_use]
    pub fn should_reconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&CloseEvent) -> bool + Send + Sync + 'static,
    {
        self.should_reconnect = Arc::new(f);
        self
    }

    /// Produces the heartbeat payload. Returning `None` or an empty payload skips the tick.
    #[must_use]
    pub fn heartbeat_payload<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<Payload> + Send + Sync + 'static,
    {
        self.heartbeat_payload = Arc::new(f);
        self
    }
}

/// Runs a user callback, converting a panic into `None`.
pub(crate) fn guarded<R, F>(callback: &'static str, f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            #[cfg(feature = "tracing")]
            tracing::error!(callback, %message, "User callback panicked");
            #[cfg(not(feature = "tracing"))]
            let _ = (callback, message);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handlers_reconnect_and_ping() {
        let handlers = Handlers::default();

        assert!((handlers.should_reconnect)(&CloseEvent::abnormal("")));
        assert_eq!((handlers.heartbeat_payload)(), Some(Payload::from("ping")));
    }

    #[test]
    fn guarded_swallows_panics() {
        let result: Option<()> = guarded("test", || panic!("boom"));
        assert!(result.is_none(), "panic should be converted to None");

        assert_eq!(guarded("test", || 7), Some(7));
    }
}
