#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use resilient_ws::error::Kind;
use resilient_ws::ws::config::{Config, ReconnectConfig};
use resilient_ws::ws::{ConnectionManager, ConnectionState, Epoch, Handlers, Payload, WsError};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[derive(Debug, Clone)]
enum ServerCommand {
    /// Push a text frame to every client
    Send(String),
    /// Drop every connection without a closing handshake
    Drop,
    /// Start a closing handshake with every client
    Close(u16),
}

/// Mock WebSocket server that echoes text frames back to the sender.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast commands to ALL connected clients
    command_tx: broadcast::Sender<ServerCommand>,
    /// Text frames received from clients, heartbeats included
    received_rx: mpsc::UnboundedReceiver<String>,
    /// Close codes received from clients
    close_rx: mpsc::UnboundedReceiver<Option<u16>>,
    /// Number of accepted WebSocket connections
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<ServerCommand>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let (close_tx, close_rx) = mpsc::unbounded_channel::<Option<u16>>();
        let connections = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = command_tx.clone();
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let close_tx = close_tx.clone();
                let mut command_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let text = text.to_string();
                                        drop(received_tx.send(text.clone()));
                                        if text != "ping"
                                            && write.send(Message::Text(text.into())).await.is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        // Keep reading so tungstenite flushes the close reply
                                        drop(close_tx.send(frame.map(|f| u16::from(f.code))));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(ServerCommand::Send(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCommand::Close(code)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "server closing".to_owned().into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                    }
                                    Ok(ServerCommand::Drop) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            received_rx,
            close_rx,
            connections,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    fn send(&self, message: &str) {
        drop(self.command_tx.send(ServerCommand::Send(message.to_owned())));
    }

    fn disconnect_all(&self) {
        drop(self.command_tx.send(ServerCommand::Drop));
    }

    fn close_all(&self, code: u16) {
        drop(self.command_tx.send(ServerCommand::Close(code)));
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Receive the next text frame sent by a client.
    async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next non-heartbeat text frame sent by a client.
    async fn recv_non_heartbeat(&mut self) -> Option<String> {
        loop {
            let text = self.recv().await?;
            if text != "ping" {
                return Some(text);
            }
        }
    }

    async fn recv_close(&mut self) -> Option<Option<u16>> {
        timeout(Duration::from_secs(2), self.close_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

fn config() -> Config {
    Config::builder()
        .connect_timeout(Duration::from_secs(2))
        .heartbeat_interval(Duration::from_secs(30))
        .reconnect(
            ReconnectConfig::builder()
                .interval(Duration::from_millis(50))
                .max_attempts(5)
                .build(),
        )
        .build()
}

/// Handlers that forward inbound payloads into a channel.
fn forwarding_handlers() -> (Handlers, mpsc::UnboundedReceiver<Payload>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handlers = Handlers::default().on_message(move |payload| drop(tx.send(payload)));
    (handlers, rx)
}

async fn recv_payload(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Option<Payload> {
    timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
}

async fn wait_for_state<F>(connection: &ConnectionManager, predicate: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    let mut state_rx = connection.state_receiver();
    let state = timeout(Duration::from_secs(2), state_rx.wait_for(predicate))
        .await
        .expect("state change timed out")
        .unwrap();
    *state
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn sends_and_receives_over_open_connection() {
        let mut server = MockWsServer::start().await;
        let (handlers, mut rx) = forwarding_handlers();
        let connection = ConnectionManager::new(&server.ws_url("/echo"), config(), handlers).unwrap();

        connection.connect().await.unwrap();
        connection.send("hello").await.unwrap();

        assert_eq!(server.recv_non_heartbeat().await.as_deref(), Some("hello"));
        assert_eq!(recv_payload(&mut rx).await, Some(Payload::from("hello")));
        assert!(connection.state().is_open());
    }

    #[tokio::test]
    async fn server_push_is_delivered_to_handler() {
        let server = MockWsServer::start().await;
        let (handlers, mut rx) = forwarding_handlers();
        let connection = ConnectionManager::new(&server.ws_url("/push"), config(), handlers).unwrap();

        connection.connect().await.unwrap();
        server.send("update");

        assert_eq!(recv_payload(&mut rx).await, Some(Payload::from("update")));
    }

    #[tokio::test]
    async fn send_json_serializes_request() {
        #[derive(Serialize)]
        struct Subscribe {
            channel: &'static str,
        }

        let mut server = MockWsServer::start().await;
        let connection =
            ConnectionManager::new(&server.ws_url("/json"), config(), Handlers::default()).unwrap();

        connection.connect().await.unwrap();
        connection
            .send_json(&Subscribe { channel: "prices" })
            .await
            .unwrap();

        assert_eq!(
            server.recv_non_heartbeat().await.as_deref(),
            Some(r#"{"channel":"prices"}"#)
        );
    }

    #[tokio::test]
    async fn heartbeat_reaches_server() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .build();
        let connection =
            ConnectionManager::new(&server.ws_url("/hb"), config, Handlers::default()).unwrap();

        connection.connect().await.unwrap();

        assert_eq!(server.recv().await.as_deref(), Some("ping"));
        assert_eq!(server.recv().await.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn auto_connect_on_send() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder().auto_connect_on_send(true).build();
        let connection =
            ConnectionManager::new(&server.ws_url("/auto"), config, Handlers::default()).unwrap();

        connection.send("first").await.unwrap();

        assert_eq!(server.recv_non_heartbeat().await.as_deref(), Some("first"));
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connection =
            ConnectionManager::new(&format!("ws://{addr}"), config(), Handlers::default()).unwrap();

        let error = connection.connect().await.unwrap_err();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::ConnectFailed(_))
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn rejects_http_address() {
        let result = ConnectionManager::new("https://example.com", config(), Handlers::default());

        assert_eq!(result.err().unwrap().kind(), Kind::Validation);
    }
}

mod reconnection {
    use super::*;

    fn reconnect_handlers() -> (Handlers, mpsc::UnboundedReceiver<Epoch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Handlers::default().on_reconnect_success(move |epoch| drop(tx.send(epoch)));
        (handlers, rx)
    }

    #[tokio::test]
    async fn reconnects_after_connection_drop() {
        let mut server = MockWsServer::start().await;
        let (handlers, mut reconnected) = reconnect_handlers();
        let connection = ConnectionManager::new(&server.ws_url("/drop"), config(), handlers).unwrap();

        let first = connection.connect().await.unwrap();
        server.disconnect_all();

        let epoch = timeout(Duration::from_secs(2), reconnected.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(epoch > first);

        // The new connection is usable
        connection.send("after").await.unwrap();
        assert_eq!(server.recv_non_heartbeat().await.as_deref(), Some("after"));
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn server_normal_close_does_not_reconnect() {
        let server = MockWsServer::start().await;
        let (handlers, mut reconnected) = reconnect_handlers();
        let connection =
            ConnectionManager::new(&server.ws_url("/normal"), config(), handlers).unwrap();

        connection.connect().await.unwrap();
        server.close_all(1000);

        wait_for_state(&connection, |state| *state == ConnectionState::Closed).await;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(server.connections(), 1);
        assert!(reconnected.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_error_close_reconnects() {
        let server = MockWsServer::start().await;
        let (handlers, mut reconnected) = reconnect_handlers();
        let connection =
            ConnectionManager::new(&server.ws_url("/error"), config(), handlers).unwrap();

        connection.connect().await.unwrap();
        server.close_all(1011);

        assert!(
            timeout(Duration::from_secs(2), reconnected.recv())
                .await
                .is_ok(),
            "Should reconnect after an error close"
        );
        assert!(connection.state().is_open());
    }

    #[tokio::test]
    async fn explicit_close_sends_code_and_stays_closed() {
        let mut server = MockWsServer::start().await;
        let (handlers, mut reconnected) = reconnect_handlers();
        let connection =
            ConnectionManager::new(&server.ws_url("/close"), config(), handlers).unwrap();

        connection.connect().await.unwrap();
        connection.close(4000, "done").await.unwrap();

        assert_eq!(server.recv_close().await, Some(Some(4000)));
        wait_for_state(&connection, |state| *state == ConnectionState::Closed).await;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(server.connections(), 1);
        assert!(reconnected.try_recv().is_err());
        assert!(connection.send("late").await.is_err());
    }
}
