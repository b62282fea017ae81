use std::fmt;

use tokio::time::Instant;

/// Close code for an intentional, non-error termination.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when a socket went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// A raw WebSocket payload. The manager never inspects its contents.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Binary(bytes) => bytes.is_empty(),
        }
    }

    /// Converts text into its UTF-8 bytes; binary payloads are returned unchanged.
    #[must_use]
    pub fn into_binary(self) -> Self {
        match self {
            Self::Text(text) => Self::Binary(text.into_bytes()),
            binary @ Self::Binary(_) => binary,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// Close notification delivered by the socket.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// Identifies one underlying socket, from its creation to its closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub(crate) u64);

impl Epoch {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    pub(crate) const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why automatic reconnection was abandoned.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum StopReason {
    #[strum(serialize = "attempts exhausted")]
    AttemptsExhausted,
    #[strum(serialize = "time budget exceeded")]
    TimeExceeded,
    #[strum(serialize = "vetoed")]
    Vetoed,
}

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never connected
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Open {
        /// Socket the connection runs on
        epoch: Epoch,
        /// When the connection was established
        since: Instant,
    },
    /// Close frame sent, waiting for the socket to report closure
    Closing,
    /// Not connected, either terminally or between reconnection attempts
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}
