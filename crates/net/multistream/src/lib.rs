//! `/multistream/1.0.0` protocol selection over the stream transport.
//!
//! The negotiator is itself a [`StreamHandler`]: it runs the handshake and
//! negotiation exchange on a freshly-started transport and, once a
//! protocol is agreed, swaps the winning entry's handler into its own
//! place. The socket never reopens; the selected protocol simply takes
//! over the running transport.

use std::{fmt, time::Duration};

use bytes::Bytes;
use strand_net_stream::StreamHandler;

mod error;
mod handler;

pub use error::MultistreamError;
pub use handler::MultistreamHandler;

/// The multistream protocol identifier, sent as the handshake header line.
pub const PROTOCOL_ID: &str = "/multistream/1.0.0";

/// Default server-side deadline for the whole negotiation.
pub const DEFAULT_NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds of the jittered client handshake deadline window.
pub(crate) const HANDSHAKE_FLOOR: Duration = Duration::from_secs(15);
pub(crate) const HANDSHAKE_JITTER: Duration = Duration::from_secs(20);

/// Timeout configuration for a negotiator.
#[derive(Debug, Clone)]
pub struct MultistreamConfig {
    /// Server-side deadline covering handshake and negotiation.
    pub negotiate_timeout: Duration,
    /// Client-side handshake deadline. `None` picks a jittered deadline in
    /// the 15–35 s window, spreading reconnect storms across peers.
    pub handshake_timeout: Option<Duration>,
}

impl Default for MultistreamConfig {
    fn default() -> Self {
        Self {
            negotiate_timeout: DEFAULT_NEGOTIATE_TIMEOUT,
            handshake_timeout: None,
        }
    }
}

/// What a winning negotiation hands to the selected protocol's builder.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The full protocol line the peers agreed on.
    pub protocol: Bytes,
    /// Remainder of the line past the matched prefix (server side); empty
    /// for clients.
    pub path: Bytes,
}

/// One negotiable protocol: a prefix and a builder producing its handler.
pub struct ProtocolEntry {
    prefix: String,
    builder: Box<dyn FnMut(Negotiated) -> Box<dyn StreamHandler> + Send>,
}

impl ProtocolEntry {
    /// Register `prefix` with a builder for its protocol handler.
    pub fn new<F>(prefix: impl Into<String>, builder: F) -> Self
    where
        F: FnMut(Negotiated) -> Box<dyn StreamHandler> + Send + 'static,
    {
        Self {
            prefix: prefix.into(),
            builder: Box::new(builder),
        }
    }

    /// The registered protocol prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn build(&mut self, negotiated: Negotiated) -> Box<dyn StreamHandler> {
        (self.builder)(negotiated)
    }
}

impl fmt::Debug for ProtocolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEntry")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
