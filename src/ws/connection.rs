#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::StreamExt as _;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::handlers::{Handlers, guarded};
use super::timer::{self, TimerSlot};
use super::traits::{Connector, Socket, SocketEvent, SocketListener};
use super::transport::TungsteniteConnector;
use super::types::{CloseEvent, ConnectionState, Epoch, NORMAL_CLOSURE, Payload, StopReason};
use crate::Result;
use crate::error::Error;

/// Lifecycle logging, emitted only when `debug_logging` is configured.
#[cfg(feature = "tracing")]
macro_rules! lifecycle {
    ($task:expr, $($arg:tt)+) => {
        if $task.config.debug_logging {
            tracing::debug!($($arg)+);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! lifecycle {
    ($task:expr, $($arg:tt)+) => {
        let _ = &$task;
    };
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Connect(Reply<Epoch>),
    Send { payload: Payload, reply: Reply<()> },
    Close { code: u16, reason: String, reply: Reply<()> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ConnectTimeout,
    Heartbeat,
    Reconnect,
}

/// Notifications delivered to the connection task. Each one names the epoch it
/// belongs to and is dropped when that epoch is no longer current.
enum Event {
    Opened { epoch: Epoch, socket: Socket },
    ConnectFailed { epoch: Epoch, reason: String },
    Socket { epoch: Epoch, event: SocketEvent },
    Timer { kind: TimerKind, id: u64, epoch: Epoch },
}

enum Outbound {
    Payload {
        payload: Payload,
        reply: Option<Reply<()>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Reconnect,
}

struct PendingConnect {
    epoch: Epoch,
    origin: Origin,
    task: JoinHandle<()>,
    waiters: Vec<Reply<Epoch>>,
    queued: Vec<(Payload, Reply<()>)>,
}

struct OpenSocket {
    epoch: Epoch,
    outbound: mpsc::UnboundedSender<Outbound>,
    io: JoinHandle<()>,
}

/// Keeps a single WebSocket connection alive on behalf of its owner.
///
/// The manager handles:
/// - Connecting with a timeout
/// - Heartbeat payloads while the connection is open
/// - Automatic reconnection, bounded by an attempt count and a time budget
/// - Delivering every inbound frame to [`Handlers::on_message`]
///
/// All state lives in a background task; this handle is cheap to clone. The task
/// ends once [`close`](Self::close) completed and every handle was dropped.
/// Dropping every handle without closing performs a normal close.
///
/// # Example
///
/// ```no_run
/// use resilient_ws::ws::{ConnectionManager, Handlers};
/// use resilient_ws::ws::config::Config;
///
/// # async fn example() -> resilient_ws::Result<()> {
/// let handlers = Handlers::default().on_message(|payload| println!("{payload:?}"));
/// let connection = ConnectionManager::new("wss://echo.websocket.org", Config::default(), handlers)?;
///
/// connection.connect().await?;
/// connection.send("hello").await?;
/// connection.close_normal().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    /// Sender channel for commands to the connection task
    command_tx: mpsc::UnboundedSender<Command>,
    /// Watch channel receiver for state changes
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Create a connection manager for `address` using the tungstenite transport.
    ///
    /// No connection is made until [`connect`](Self::connect) is called, or until
    /// [`send`](Self::send) is called with `auto_connect_on_send` configured.
    pub fn new(address: &str, config: Config, handlers: Handlers) -> Result<Self> {
        Self::with_connector(address, config, handlers, TungsteniteConnector)
    }

    /// Create a connection manager that opens its sockets through `connector`.
    pub fn with_connector<C: Connector>(
        address: &str,
        config: Config,
        handlers: Handlers,
        connector: C,
    ) -> Result<Self> {
        let url = Url::parse(address)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "{address} is not a ws:// or wss:// address"
            )));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let task = ConnectionTask {
            address: url.into(),
            backoff: (&config.reconnect).into(),
            remaining_attempts: config.reconnect.max_attempts,
            config,
            handlers,
            connector: Arc::new(connector),
            event_tx,
            state_tx,
            state: ConnectionState::Idle,
            epoch: Epoch::default(),
            socket: None,
            pending: None,
            reconnect_deadline: None,
            permanently_closed: false,
            connect_timer: TimerSlot::default(),
            heartbeat_timer: TimerSlot::default(),
            reconnect_timer: TimerSlot::default(),
            next_timer_id: 0,
        };

        tokio::spawn(task.run(command_rx, event_rx));

        Ok(Self {
            command_tx,
            state_rx,
        })
    }

    /// Open the connection, or return the current one if it is already open.
    ///
    /// Calls made while an attempt is in flight share that attempt's outcome.
    pub async fn connect(&self) -> Result<Epoch> {
        self.request(Command::Connect).await
    }

    /// Send a payload over the open connection.
    ///
    /// When no connection is open, the payload is either dropped with
    /// [`WsError::NotConnected`] or, with `auto_connect_on_send`, sent after an
    /// implicit [`connect`](Self::connect) succeeds.
    pub async fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        let payload = payload.into();
        self.request(|reply| Command::Send { payload, reply }).await
    }

    /// Serialize `request` to JSON and send it as a text payload.
    pub async fn send_json<R: Serialize>(&self, request: &R) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.send(json).await
    }

    /// Close the connection for good. No reconnection happens afterwards, whatever
    /// close code the socket reports.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let reason = reason.to_owned();
        self.request(|reply| Command::Close {
            code,
            reason,
            reply,
        })
        .await
    }

    /// [`close`](Self::close) with the normal closure code.
    pub async fn close_normal(&self) -> Result<()> {
        self.close(NORMAL_CLOSURE, "normal").await
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn request<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_e| WsError::ConnectionClosed)?;
        reply_rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }
}

/// Owns every piece of connection state. Runs as a single task, so commands,
/// socket notifications and timer expiries are handled one at a time.
struct ConnectionTask {
    address: String,
    config: Config,
    handlers: Handlers,
    connector: Arc<dyn Connector>,
    event_tx: mpsc::UnboundedSender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    /// Most recently started epoch
    epoch: Epoch,
    socket: Option<OpenSocket>,
    pending: Option<PendingConnect>,
    /// `None` means unlimited
    remaining_attempts: Option<u32>,
    reconnect_deadline: Option<Instant>,
    permanently_closed: bool,
    backoff: ExponentialBackoff,
    connect_timer: TimerSlot,
    heartbeat_timer: TimerSlot,
    reconnect_timer: TimerSlot,
    next_timer_id: u64,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone
                    None => break,
                },
                Some(event) = event_rx.recv() => self.handle_event(event),
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Send { payload, reply } => self.send(payload, reply),
            Command::Close {
                code,
                reason,
                reply,
            } => {
                self.close(code, &reason);
                _ = reply.send(Ok(()));
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { epoch, socket } => {
                if self.pending_epoch() == Some(epoch) {
                    self.on_open(socket);
                }
                // Otherwise the attempt was abandoned; dropping the socket closes it.
            }
            Event::ConnectFailed { epoch, reason } => {
                if self.pending_epoch() == Some(epoch) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%epoch, %reason, "Unable to connect");
                    self.fail_connect(&|| WsError::ConnectFailed(reason.clone()));
                }
            }
            Event::Socket { epoch, event } => {
                if self.socket.as_ref().is_some_and(|socket| socket.epoch == epoch) {
                    self.dispatch(event);
                }
            }
            Event::Timer { kind, id, epoch } => self.on_timer(kind, id, epoch),
        }
    }

    fn on_timer(&mut self, kind: TimerKind, id: u64, epoch: Epoch) {
        match kind {
            TimerKind::ConnectTimeout => {
                if self.connect_timer.is_current(id) && self.pending_epoch() == Some(epoch) {
                    let after = self.config.connect_timeout;
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%epoch, ?after, "Connect timed out");
                    self.fail_connect(&|| WsError::ConnectTimeout(after));
                }
            }
            TimerKind::Heartbeat => {
                if self.heartbeat_timer.is_current(id) && self.open_epoch() == Some(epoch) {
                    self.heartbeat();
                }
            }
            TimerKind::Reconnect => {
                if self.reconnect_timer.is_current(id) && self.epoch == epoch {
                    self.reconnect_timer.cancel();
                    self.remaining_attempts = self.remaining_attempts.map(|n| n.saturating_sub(1));
                    lifecycle!(self, remaining = ?self.remaining_attempts, "Reconnecting");
                    self.start_connect(Origin::Reconnect);
                }
            }
        }
    }

    fn connect(&mut self, reply: Reply<Epoch>) {
        if self.permanently_closed {
            _ = reply.send(Err(WsError::PermanentlyClosed.into()));
            return;
        }

        if let Some(epoch) = self.open_epoch() {
            _ = reply.send(Ok(epoch));
            return;
        }

        self.ensure_connecting().waiters.push(reply);
    }

    fn send(&mut self, payload: Payload, reply: Reply<()>) {
        if self.permanently_closed {
            _ = reply.send(Err(WsError::PermanentlyClosed.into()));
            return;
        }

        if let Some(socket) = &self.socket {
            let outbound = Outbound::Payload {
                payload,
                reply: Some(reply),
            };
            if let Err(mpsc::error::SendError(Outbound::Payload {
                reply: Some(reply), ..
            })) = socket.outbound.send(outbound)
            {
                _ = reply.send(Err(WsError::ConnectionClosed.into()));
            }
            return;
        }

        if self.config.auto_connect_on_send {
            self.ensure_connecting().queued.push((payload, reply));
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(?payload, "Not connected, dropping payload");
            _ = reply.send(Err(WsError::NotConnected.into()));
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self.permanently_closed {
            return;
        }
        self.permanently_closed = true;

        self.connect_timer.cancel();
        self.heartbeat_timer.cancel();
        self.reconnect_timer.cancel();

        if let Some(pending) = self.pending.take() {
            pending.task.abort();
            Self::reject(pending, &|| WsError::PermanentlyClosed);
        }

        lifecycle!(self, code, reason, "Closing connection");

        let closing = self.socket.as_ref().is_some_and(|socket| {
            socket
                .outbound
                .send(Outbound::Close {
                    code,
                    reason: reason.to_owned(),
                })
                .is_ok()
        });

        if closing {
            self.set_state(ConnectionState::Closing);
        } else {
            self.discard_socket();
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Returns the in-flight attempt, starting one if there is none.
    #[expect(
        clippy::ref_patterns,
        reason = "Binding by reference keeps the other arm free to borrow self"
    )]
    fn ensure_connecting(&mut self) -> &mut PendingConnect {
        match self.pending {
            Some(ref mut pending) => pending,
            None => {
                // An attempt made while a reconnect is scheduled takes its place and
                // spends its budget, so a failure resumes the reconnect procedure.
                let origin = if self.reconnect_timer.is_armed() {
                    self.reconnect_timer.cancel();
                    self.remaining_attempts = self.remaining_attempts.map(|n| n.saturating_sub(1));
                    Origin::Reconnect
                } else {
                    Origin::Caller
                };
                self.start_connect(origin)
            }
        }
    }

    fn start_connect(&mut self, origin: Origin) -> &mut PendingConnect {
        self.discard_socket();
        if let Some(stale) = self.pending.take() {
            stale.task.abort();
        }

        self.epoch = self.epoch.next();
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting);
        lifecycle!(self, %epoch, address = %self.address, ?origin, "Connecting");

        let connector = Arc::clone(&self.connector);
        let address = self.address.clone();
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let event = match connector.connect(&address).await {
                Ok(socket) => Event::Opened { epoch, socket },
                Err(e) => Event::ConnectFailed {
                    epoch,
                    reason: e.to_string(),
                },
            };
            _ = event_tx.send(event);
        });

        let (id, handle) = {
            let id = self.timer_id();
            let event_tx = self.event_tx.clone();
            let handle = timer::after(self.config.connect_timeout, move || {
                _ = event_tx.send(Event::Timer {
                    kind: TimerKind::ConnectTimeout,
                    id,
                    epoch,
                });
            });
            (id, handle)
        };
        self.connect_timer.arm(id, handle);

        self.pending.insert(PendingConnect {
            epoch,
            origin,
            task,
            waiters: Vec::new(),
            queued: Vec::new(),
        })
    }

    fn fail_connect(&mut self, error: &dyn Fn() -> WsError) {
        self.connect_timer.cancel();
        let Some(pending) = self.pending.take() else {
            return;
        };
        pending.task.abort();
        self.set_state(ConnectionState::Closed);

        let origin = pending.origin;
        let reason = error().to_string();
        Self::reject(pending, error);

        // Reconnect attempts report failure like a socket that closed before opening.
        if origin == Origin::Reconnect && !self.permanently_closed {
            self.on_close(CloseEvent::abnormal(reason));
        }
    }

    fn reject(pending: PendingConnect, error: &dyn Fn() -> WsError) {
        for waiter in pending.waiters {
            _ = waiter.send(Err(error().into()));
        }
        for (_, reply) in pending.queued {
            _ = reply.send(Err(error().into()));
        }
    }

    /// Evaluate the stop conditions and either schedule the next attempt or give up.
    fn reconnect(&mut self, event: &CloseEvent) {
        let now = Instant::now();

        let stop = if self.reconnect_deadline.is_some_and(|deadline| now > deadline) {
            Some(StopReason::TimeExceeded)
        } else if self.remaining_attempts == Some(0) {
            Some(StopReason::AttemptsExhausted)
        } else if !guarded("should_reconnect", || (self.handlers.should_reconnect)(event))
            .unwrap_or(false)
        {
            Some(StopReason::Vetoed)
        } else {
            None
        };

        if let Some(reason) = stop {
            #[cfg(feature = "tracing")]
            tracing::warn!(%reason, code = event.code, "Giving up on reconnection");
            if let Some(on_stopped) = &self.handlers.on_reconnect_stopped {
                guarded("on_reconnect_stopped", || on_stopped(reason, event));
            }
            return;
        }

        if self.reconnect_deadline.is_none()
            && let Some(budget) = self.config.reconnect.max_elapsed
        {
            self.reconnect_deadline = Some(now + budget);
        }

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.interval);
        lifecycle!(self, ?delay, code = event.code, "Scheduling reconnection");

        let id = self.timer_id();
        let epoch = self.epoch;
        let event_tx = self.event_tx.clone();
        self.reconnect_timer.arm(
            id,
            timer::after(delay, move || {
                _ = event_tx.send(Event::Timer {
                    kind: TimerKind::Reconnect,
                    id,
                    epoch,
                });
            }),
        );
    }

    fn heartbeat(&mut self) {
        let Some(payload) = guarded("heartbeat_payload", || (self.handlers.heartbeat_payload)())
            .flatten()
            .filter(|payload| !payload.is_empty())
        else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(?payload, "Sending heartbeat");
        if let Some(socket) = &self.socket {
            _ = socket.outbound.send(Outbound::Payload {
                payload,
                reply: None,
            });
        }
    }

    /// Stop the socket of the current epoch, if any. Its pending notifications are
    /// dropped by the epoch check.
    fn discard_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.io.abort();
        }
    }

    fn shutdown(&mut self) {
        self.connect_timer.cancel();
        self.heartbeat_timer.cancel();
        self.reconnect_timer.cancel();

        if let Some(pending) = self.pending.take() {
            pending.task.abort();
            Self::reject(pending, &|| WsError::ConnectionClosed);
        }

        // The socket task finishes the closing handshake on its own.
        if !self.permanently_closed
            && let Some(socket) = self.socket.take()
        {
            _ = socket.outbound.send(Outbound::Close {
                code: NORMAL_CLOSURE,
                reason: "normal".to_owned(),
            });
        }
    }

    fn pending_epoch(&self) -> Option<Epoch> {
        self.pending.as_ref().map(|pending| pending.epoch)
    }

    fn open_epoch(&self) -> Option<Epoch> {
        match self.state {
            ConnectionState::Open { epoch, .. } => Some(epoch),
            _ => None,
        }
    }

    fn timer_id(&mut self) -> u64 {
        self.next_timer_id = self.next_timer_id.wrapping_add(1);
        self.next_timer_id
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

impl SocketListener for ConnectionTask {
    fn on_open(&mut self, socket: Socket) {
        self.connect_timer.cancel();
        let Some(pending) = self.pending.take() else {
            return;
        };
        let epoch = pending.epoch;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let io = tokio::spawn(drive_socket(
            epoch,
            socket,
            self.config.connect_timeout,
            outbound_rx,
            self.event_tx.clone(),
        ));
        self.socket = Some(OpenSocket {
            epoch,
            outbound: outbound_tx,
            io,
        });
        self.set_state(ConnectionState::Open {
            epoch,
            since: Instant::now(),
        });

        self.remaining_attempts = self.config.reconnect.max_attempts;
        self.reconnect_deadline = None;
        self.backoff.reset();
        lifecycle!(self, %epoch, "Connection open");

        let id = self.timer_id();
        let event_tx = self.event_tx.clone();
        self.heartbeat_timer.arm(
            id,
            timer::every(self.config.heartbeat_interval, move || {
                _ = event_tx.send(Event::Timer {
                    kind: TimerKind::Heartbeat,
                    id,
                    epoch,
                });
            }),
        );

        let PendingConnect {
            origin,
            waiters,
            queued,
            ..
        } = pending;

        for waiter in waiters {
            _ = waiter.send(Ok(epoch));
        }
        if let Some(socket) = &self.socket {
            for (payload, reply) in queued {
                _ = socket.outbound.send(Outbound::Payload {
                    payload,
                    reply: Some(reply),
                });
            }
        }

        if origin == Origin::Reconnect
            && let Some(on_success) = &self.handlers.on_reconnect_success
        {
            guarded("on_reconnect_success", || on_success(epoch));
        }
    }

    fn on_message(&mut self, payload: Payload) {
        let payload = if self.config.binary_mode {
            payload.into_binary()
        } else {
            payload
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(?payload, "Received WebSocket message");
        guarded("on_message", || (self.handlers.on_message)(payload));
    }

    fn on_error(&mut self, error: &str) {
        // A close notification follows; reconnection is driven from there.
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "WebSocket error");
        #[cfg(not(feature = "tracing"))]
        let _ = error;
    }

    fn on_close(&mut self, event: CloseEvent) {
        self.heartbeat_timer.cancel();
        self.reconnect_timer.cancel();
        self.discard_socket();
        self.set_state(ConnectionState::Closed);

        if self.permanently_closed || event.is_normal() {
            lifecycle!(self, code = event.code, reason = %event.reason, "Connection closed");
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(code = event.code, reason = %event.reason, "Connection lost");
        self.reconnect(&event);
    }
}

/// Pump one socket: forward its notifications to the connection task and write
/// what the task hands over, in order.
///
/// Once a close frame is written the peer has `close_timeout` to acknowledge it;
/// after that the socket is reported closed abnormally and abandoned.
async fn drive_socket(
    epoch: Epoch,
    socket: Socket,
    close_timeout: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let Socket {
        mut writer,
        mut events,
    } = socket;

    let close_wait = time::sleep(close_timeout);
    tokio::pin!(close_wait);
    let mut closing = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let (event, last) = match event {
                    Some(event @ SocketEvent::Close(_)) => (event, true),
                    Some(event) => (event, false),
                    None => (SocketEvent::Close(CloseEvent::abnormal("socket stream ended")), true),
                };
                if event_tx.send(Event::Socket { epoch, event }).is_err() || last {
                    break;
                }
            }

            Some(outbound) = outbound_rx.recv() => match outbound {
                Outbound::Payload { payload, reply } => {
                    let result = writer.send(payload).await;
                    if let Err(e) = &result {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%epoch, error = %e, "Failed to send WebSocket message");
                        #[cfg(not(feature = "tracing"))]
                        let _ = e;
                    }
                    if let Some(reply) = reply {
                        _ = reply.send(result);
                    }
                }
                Outbound::Close { code, reason } => {
                    if let Err(e) = writer.close(code, &reason).await {
                        let event = SocketEvent::Close(CloseEvent::abnormal(e.to_string()));
                        _ = event_tx.send(Event::Socket { epoch, event });
                        break;
                    }
                    closing = true;
                    close_wait.as_mut().reset(Instant::now() + close_timeout);
                }
            },

            () = &mut close_wait, if closing => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%epoch, ?close_timeout, "Peer did not acknowledge close");
                let event = SocketEvent::Close(CloseEvent::abnormal("close handshake timed out"));
                _ = event_tx.send(Event::Socket { epoch, event });
                break;
            }
        }
    }
}
