#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The connect timeout elapsed before the socket opened
    ConnectTimeout(Duration),
    /// The socket failed before it opened
    ConnectFailed(String),
    /// Operation requires an open connection
    NotConnected,
    /// WebSocket connection was closed, or the connection task is gone
    ConnectionClosed,
    /// The manager was closed by its owner and will not connect again
    PermanentlyClosed,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectTimeout(after) => {
                write!(f, "WebSocket did not open within {after:?}")
            }
            Self::ConnectFailed(reason) => write!(f, "WebSocket failed to open: {reason}"),
            Self::NotConnected => write!(f, "WebSocket is not connected"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::PermanentlyClosed => write!(f, "WebSocket connection was closed by its owner"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}
