use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::traits::{Connector, Socket, SocketEvent, SocketWriter};
use super::types::{CloseEvent, Payload};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer sent a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// [`Connector`] over `tokio-tungstenite`, supporting `ws://` and `wss://` addresses.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, address: &str) -> Result<Socket> {
        let (ws_stream, _) = connect_async(address).await?;
        let (write, read) = ws_stream.split();

        let events = read
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => {
                        Some(SocketEvent::Message(Payload::Text(text.to_string())))
                    }
                    Ok(Message::Binary(bytes)) => {
                        Some(SocketEvent::Message(Payload::Binary(bytes.to_vec())))
                    }
                    Ok(Message::Close(frame)) => Some(SocketEvent::Close(match frame {
                        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.as_str()),
                        None => CloseEvent::new(NO_STATUS_RECEIVED, ""),
                    })),
                    // The stream ends after an error; the connection task reports that as abnormal.
                    Err(e) => Some(SocketEvent::Error(e.to_string())),
                    // PING/PONG are answered by tungstenite itself.
                    Ok(_) => None,
                }
            })
            .boxed();

        Ok(Socket::new(TungsteniteWriter { sink: write }, events))
    }
}

struct TungsteniteWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketWriter for TungsteniteWriter {
    async fn send(&mut self, payload: Payload) -> Result<()> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.sink.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}
