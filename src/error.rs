use thiserror::Error;

/// Everything that can go wrong while fetching a torrent.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer answered the handshake for a different torrent.
    #[error("info hash mismatch")]
    HandshakeMismatch,

    /// Malformed frame, length or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection reset, short read/write or file failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect, handshake or read exceeded its bound.
    #[error("timeout")]
    Timeout,

    /// Non-200 response or malformed tracker payload.
    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A finished piece did not hash to its expected value.
    #[error("piece #{index} failed hash check")]
    HashMismatch { index: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Errors that only concern one peer connection; the session survives them.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            Error::HandshakeMismatch
                | Error::Protocol(_)
                | Error::Io(_)
                | Error::Timeout
                | Error::HashMismatch { .. }
        )
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

pub type Result<T> = std::result::Result<T, Error>;
