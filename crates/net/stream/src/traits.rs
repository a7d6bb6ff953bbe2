//! The handler ABI: the callback contract a protocol module implements to
//! run on a stream transport, and the actions it returns.

use std::{any::Any, borrow::Cow, fmt, io, time::Duration};

use bytes::Bytes;
use strand_net_codec::PacketSpec;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{error::ExitReason, sender::SendFn};

/// Connection role of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Client,
    Server,
}

impl Kind {
    /// The opposite role, as toggled by [`Action::SwapKind`].
    pub fn flip(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Inbound flow-control mode.
///
/// `Once` arms exactly one packet delivery and reverts to `Off` before the
/// handler's return actions are applied, so the handler may re-arm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Active {
    /// Quiescent: bytes already buffered stay put, the socket is not read.
    #[default]
    Off,
    /// Deliver one packet, then revert to `Off`.
    Once,
    /// Deliver packets continuously.
    On,
}

/// Key identifying a handler timer. Re-arming a key replaces its timer.
pub type TimerKey = Cow<'static, str>;

/// Opaque command payload passed through [`crate::StreamHandle::command`].
pub type CommandPayload = Box<dyn Any + Send>;

/// Opaque reply value released to a command caller.
pub type ReplyValue = Box<dyn Any + Send>;

/// Opaque message injected via [`crate::StreamHandle::info`].
pub type InfoPayload = Box<dyn Any + Send>;

/// One-shot token releasing a parked command caller.
///
/// Consumed by [`Action::Reply`]; dropping it fails the caller with
/// [`crate::Closed`]. A handler that cannot answer immediately stashes the
/// token in its own state and replies from a later callback.
pub struct ReplyToken(oneshot::Sender<ReplyValue>);

impl ReplyToken {
    pub(crate) fn new(tx: oneshot::Sender<ReplyValue>) -> Self {
        Self(tx)
    }

    pub(crate) fn send(self, value: ReplyValue) {
        let _ = self.0.send(value);
    }
}

impl fmt::Debug for ReplyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyToken")
    }
}

/// Non-packet event delivered to a handler's `on_info`.
pub enum Info {
    /// A timer armed with [`Action::Timer`] fired while still armed.
    Timeout(TimerKey),
    /// The async sender failed a write. Non-fatal; stopping is the
    /// handler's call.
    SendError(io::Error),
    /// Message injected by an external task.
    User(InfoPayload),
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(key) => f.debug_tuple("Timeout").field(key).finish(),
            Self::SendError(error) => f.debug_tuple("SendError").field(error).finish(),
            Self::User(_) => f.write_str("User(..)"),
        }
    }
}

/// Declarative instruction returned by a handler callback, interpreted by
/// the transport in list order.
pub enum Action {
    /// Enqueue raw bytes on the async sender. Framing is the handler's job.
    Send(Bytes),
    /// Install a framing spec. Buffered bytes are re-decoded under the new
    /// spec before any new socket bytes are accepted. Re-installing the
    /// current spec is a no-op.
    PacketSpec(PacketSpec),
    /// Change the inbound flow-control mode. Re-applying the current mode
    /// is a no-op.
    Active(Active),
    /// Release a parked command caller with a value.
    Reply(ReplyToken, ReplyValue),
    /// Arm (or re-arm, replacing) a keyed timer; the handler receives
    /// [`Info::Timeout`] if the key is still armed when it fires.
    Timer(TimerKey, Duration),
    /// Disarm a keyed timer; no-op if not armed.
    CancelTimer(TimerKey),
    /// Replace the async sender's write destination. The previous sender
    /// drains its queue and stops.
    SendFn(Box<dyn SendFn>),
    /// Replace the running handler. Performed after the rest of this action
    /// list; the new handler's `init` actions then run before any message
    /// reaches it.
    Swap(Box<dyn StreamHandler>),
    /// Toggle the transport between client and server roles.
    SwapKind,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(data) => f.debug_tuple("Send").field(&data.len()).finish(),
            Self::PacketSpec(spec) => f.debug_tuple("PacketSpec").field(spec).finish(),
            Self::Active(mode) => f.debug_tuple("Active").field(mode).finish(),
            Self::Reply(..) => f.write_str("Reply(..)"),
            Self::Timer(key, after) => f.debug_tuple("Timer").field(key).field(after).finish(),
            Self::CancelTimer(key) => f.debug_tuple("CancelTimer").field(key).finish(),
            Self::SendFn(_) => f.write_str("SendFn(..)"),
            Self::Swap(handler) => f.debug_tuple("Swap").field(&handler.protocol_id()).finish(),
            Self::SwapKind => f.write_str("SwapKind"),
        }
    }
}

/// Outcome of a handler callback: keep running or stop the transport, each
/// with actions the transport applies in order first.
#[derive(Debug)]
pub enum HandlerResult {
    Continue(Vec<Action>),
    Stop(ExitReason, Vec<Action>),
}

/// A protocol module driven by a stream transport.
///
/// `init` and `on_packet` are the required surface. The remaining
/// callbacks default to warn-and-drop (or no-op for `on_terminate`), so a
/// handler implements only what its protocol needs. Handler state lives in
/// the implementing type itself; the transport owns it behind a `Box` and
/// replaces it wholesale on [`Action::Swap`].
pub trait StreamHandler: Send + 'static {
    /// Identifier recorded in the transport's metadata stack.
    fn protocol_id(&self) -> &'static str;

    /// Runs when the handler is installed: at transport start, or after the
    /// swap that put it in place.
    fn init(&mut self, kind: Kind) -> HandlerResult;

    /// Runs once per decoded packet while the transport is active.
    fn on_packet(&mut self, kind: Kind, headers: &[u64], payload: Bytes) -> HandlerResult;

    /// Runs for timer firings, sender errors, and injected messages.
    fn on_info(&mut self, kind: Kind, info: Info) -> HandlerResult {
        warn!(
            protocol = self.protocol_id(),
            ?kind,
            ?info,
            "dropping unsolicited info message"
        );
        HandlerResult::Continue(Vec::new())
    }

    /// Runs for each `command` call. The default drops the token, which
    /// fails the caller.
    fn on_command(&mut self, kind: Kind, _cmd: CommandPayload, token: ReplyToken) -> HandlerResult {
        warn!(
            protocol = self.protocol_id(),
            ?kind,
            "handler does not accept commands"
        );
        drop(token);
        HandlerResult::Continue(Vec::new())
    }

    /// Runs once when the transport shuts down, after the sender drained.
    fn on_terminate(&mut self, _kind: Kind, _reason: &ExitReason) {}
}
