//! Error and exit-reason types for the stream transport.

use std::{fmt, io, sync::Arc};

use tokio::sync::mpsc;

/// Reason a transport instance terminated.
///
/// Handed to the handler's `on_terminate` and logged. Protocol handlers
/// supply their own reasons through [`ExitReason::protocol`].
#[derive(Debug, Clone)]
pub enum ExitReason {
    /// Clean shutdown: handler asked to stop, or the owner killed the
    /// instance.
    Normal,
    /// The peer closed the connection.
    ConnectionClosed,
    /// The socket failed while reading.
    Io(Arc<io::Error>),
    /// The outbound sender task exited without being asked to.
    SenderFailed,
    /// Handler- or codec-supplied reason.
    Protocol(Arc<dyn std::error::Error + Send + Sync>),
}

impl ExitReason {
    /// Wrap a protocol-level error as an exit reason.
    pub fn protocol<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Protocol(Arc::new(error))
    }

    /// Whether this is a clean shutdown.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Io(error) => write!(f, "i/o error: {error}"),
            Self::SenderFailed => f.write_str("sender task failed"),
            Self::Protocol(error) => write!(f, "{error}"),
        }
    }
}

/// Error from a dial attempt.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid multiaddr: {0}")]
    InvalidAddress(String),
    #[error("connection refused")]
    Refused,
    #[error("dial timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The transport this call addressed is no longer running.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("stream transport closed")]
pub struct Closed;

/// Failure notification delivered to a dialer's configured error endpoint.
#[derive(Debug)]
pub struct StreamErrorEvent {
    /// Caller-chosen tag identifying the dial attempt.
    pub tag: String,
    /// What went wrong.
    pub error: DialError,
}

/// `(recipient, tag)` endpoint that receives [`StreamErrorEvent`]s when a
/// dialer fails before its handler ever runs.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tag: String,
    tx: mpsc::UnboundedSender<StreamErrorEvent>,
}

impl ErrorSink {
    /// Create an endpoint from a tag and a recipient channel.
    pub fn new(tag: impl Into<String>, tx: mpsc::UnboundedSender<StreamErrorEvent>) -> Self {
        Self {
            tag: tag.into(),
            tx,
        }
    }

    pub(crate) fn notify(&self, error: DialError) {
        let _ = self.tx.send(StreamErrorEvent {
            tag: self.tag.clone(),
            error,
        });
    }
}
