/// Errors of the wire layer.
///
/// `Timeout` is recoverable by construction: it is only ever raised between
/// frames, so the caller can simply retry the read. Everything else means
/// the connection is unusable.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// No frame arrived within the read deadline; retry is safe.
    #[error("read timed out")]
    Timeout,

    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,

    /// Malformed frame or body; the connection must be dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether retrying the read that failed is safe.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
