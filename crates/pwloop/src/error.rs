//! Errors for the loopback engine and its daemon collaborators.

use crate::daemon::StreamId;

/// Coarse classification of a [`LoopbackError`], one per failure class the
/// tool reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed channel map, property string, or channel count.
    InvalidArgument,
    /// Daemon unreachable or handshake refused.
    ConnectFailed,
    /// Daemon rejected a stream connect.
    StreamRefused,
    /// Daemon closed the session mid-run.
    PipeBroken,
    /// Re-entrant call into a running loop.
    Busy,
    /// Operation on a session or stream that is no longer connected.
    Disconnected,
    Io,
    Backend,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid argument: channel map has {positions} positions but {channels} channels were requested")]
    ChannelMismatch { channels: u32, positions: usize },

    #[error("failed to connect to daemon: {0}")]
    ConnectFailed(String),

    #[error("stream {id} refused: {reason}")]
    StreamRefused { id: StreamId, reason: String },

    #[error("daemon closed the connection")]
    PipeBroken,

    #[error("event loop is already running")]
    Busy,

    #[error("session is disconnected")]
    Disconnected,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {id} cannot {action} while {state}")]
    InvalidState {
        id: StreamId,
        action: &'static str,
        state: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon backend error: {0}")]
    Backend(String),
}

impl LoopbackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::ChannelMismatch { .. } => ErrorKind::InvalidArgument,
            Self::ConnectFailed(_) => ErrorKind::ConnectFailed,
            Self::StreamRefused { .. } => ErrorKind::StreamRefused,
            Self::PipeBroken => ErrorKind::PipeBroken,
            Self::Busy => ErrorKind::Busy,
            Self::Disconnected | Self::UnknownStream(_) | Self::InvalidState { .. } => {
                ErrorKind::Disconnected
            }
            Self::Io(_) => ErrorKind::Io,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type Result<T, E = LoopbackError> = std::result::Result<T, E>;
