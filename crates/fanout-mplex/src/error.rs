//! Transport error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by channels, connections and backends.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel was used after `close()`.
    #[error("channel {0} is closed")]
    ChannelInvalid(u32),

    /// No terminal packet arrived before the caller's deadline.
    #[error("channel {channel_id} timed out after {timeout:?} ({received} packets received)")]
    ChannelTimeout {
        channel_id: u32,
        timeout: Duration,
        received: usize,
    },

    /// The connection was invalidated before or during the operation.
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The codec rejected the byte stream or the packet.
    #[error("codec error: {0}")]
    Codec(String),

    /// `shutdown()` was called twice on the same backend.
    #[error("backend {0} is already shut down")]
    AlreadyShutDown(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the caller may recover by retrying or degrading the response.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::AlreadyShutDown(_) | TransportError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_channel_and_progress() {
        let err = TransportError::ChannelTimeout {
            channel_id: 6,
            timeout: Duration::from_millis(250),
            received: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("channel 6"));
        assert!(msg.contains("250ms"));
        assert!(msg.contains("2 packets"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn shutdown_misuse_is_not_recoverable() {
        let err = TransportError::AlreadyShutDown("qrs1:19112".to_string());
        assert!(!err.is_recoverable());
    }
}
