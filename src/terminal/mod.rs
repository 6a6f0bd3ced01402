//! Remote shell sessions.
//!
//! [`TerminalMultiplexer`] runs any number of shell sessions on one server
//! over the shared realtime connection. Each session keeps a bounded
//! [`Transcript`] of its output for a terminal widget to render.

pub mod multiplexer;
pub mod protocol;
pub mod session;
pub mod transcript;

pub use multiplexer::{CloseOutcome, MultiplexerEvent, TerminalMultiplexer};
pub use protocol::SessionId;
pub use session::{SessionState, TerminalSession, EXIT_MARKER};
pub use transcript::Transcript;

use crate::connection::ConnectionError;

/// Errors from multiplexer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalError {
    /// No session with this id.
    UnknownSession(SessionId),
    /// A session with this id is already listed.
    DuplicateSession(SessionId),
    /// The session was already started.
    AlreadyStarted(SessionId),
    /// Rows and columns must be non-zero.
    InvalidGeometry {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
    /// The shared connection refused the frame.
    Connection(ConnectionError),
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSession(id) => write!(f, "No terminal session {id}"),
            Self::DuplicateSession(id) => write!(f, "Terminal session {id} already exists"),
            Self::AlreadyStarted(id) => write!(f, "Terminal session {id} already started"),
            Self::InvalidGeometry { rows, cols } => {
                write!(f, "Invalid terminal size {rows}x{cols}")
            }
            Self::Connection(e) => write!(f, "Connection error: {e}"),
        }
    }
}

impl std::error::Error for TerminalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}
