//! Error type for the multistream negotiation handler.

use strand_net_codec::LineError;

/// Why a negotiation ended without selecting a protocol.
#[derive(Debug, thiserror::Error)]
pub enum MultistreamError {
    #[error("no protocol handlers configured")]
    MissingHandlers,
    #[error("unexpected handshake line: {0:?}")]
    HandshakeMismatch(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("negotiation timed out")]
    NegotiateTimeout,
    #[error("server rejected every configured protocol")]
    NoHandlers,
    #[error("unexpected server response: {0:?}")]
    UnexpectedServerResponse(String),
    #[error(transparent)]
    Line(#[from] LineError),
}
