//! Per-connection stream transport with a hot-swappable handler ABI.
//!
//! A transport owns one bidirectional byte channel, frames it with a
//! runtime-configurable packet spec, and drives a [`StreamHandler`] through
//! an action/callback contract. Handlers are replaced in place with
//! [`Action::Swap`] (the mechanism protocol negotiation is built on)
//! without reopening the socket or reordering queued writes.
//!
//! # Usage
//!
//! Implement [`StreamHandler`], then [`start_server`] over an accepted
//! socket or [`start_client`] toward a `/ip4/../tcp/..` multiaddr. The
//! returned [`StreamHandle`] carries commands, injected messages, and
//! address introspection; per-instance metadata is also readable from the
//! [`registry`].

use std::{fmt, time::Duration};

use multiaddr::Multiaddr;
use tokio::net::TcpStream;

mod addr;
mod error;
pub mod registry;
mod sender;
mod traits;
mod transport;

pub use addr::{socket_addr, to_multiaddr};
pub use error::{Closed, DialError, ErrorSink, ExitReason, StreamErrorEvent};
pub use sender::SendFn;
pub use traits::{
    Action, Active, CommandPayload, HandlerResult, Info, InfoPayload, Kind, ReplyToken,
    ReplyValue, StreamHandler, TimerKey,
};
pub use transport::{start, StreamHandle, StreamTarget};

/// Default deadline for a dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for starting a transport instance.
pub struct StreamOpts {
    pub(crate) handler: Box<dyn StreamHandler>,
    pub(crate) error_sink: Option<ErrorSink>,
    pub(crate) dial_timeout: Duration,
}

impl StreamOpts {
    /// Options running `handler` as the initial protocol module.
    pub fn new(handler: Box<dyn StreamHandler>) -> Self {
        Self {
            handler,
            error_sink: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Deliver dial failures to `sink` instead of only logging them.
    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Override the dial deadline.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
}

impl fmt::Debug for StreamOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOpts")
            .field("handler", &self.handler.protocol_id())
            .field("error_sink", &self.error_sink)
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

/// Start a client transport dialing `addr`.
pub fn start_client(addr: Multiaddr, opts: StreamOpts) -> StreamHandle {
    start(Kind::Client, StreamTarget::Addr(addr), opts)
}

/// Start a server transport adopting an already-connected socket.
pub fn start_server(socket: TcpStream, opts: StreamOpts) -> StreamHandle {
    start(Kind::Server, StreamTarget::Socket(socket), opts)
}
