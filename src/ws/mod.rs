//! Core WebSocket infrastructure.
//!
//! This module keeps one logical WebSocket connection alive for its owner.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: connection handle with connect timeout, heartbeat and reconnection
//! - [`Handlers`]: callbacks for messages and reconnection outcomes
//! - [`Connector`]: trait for opening raw sockets, with [`TungsteniteConnector`] as the default
//!
//! # Example
//!
//! ```ignore
//! let handlers = Handlers::default()
//!     .on_message(|payload| tx.send(payload).ok())
//!     .on_reconnect_stopped(|reason, close| warn!(%reason, code = close.code, "gave up"));
//!
//! let connection = ConnectionManager::new(endpoint, config, handlers)?;
//! connection.connect().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub(crate) mod timer;
pub mod traits;
pub mod transport;
pub mod types;

pub use connection::ConnectionManager;
pub use handlers::Handlers;
pub use traits::{Connector, Socket, SocketEvent, SocketWriter};
pub use transport::TungsteniteConnector;
pub use types::*;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
