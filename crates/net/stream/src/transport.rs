//! The per-connection transport actor.
//!
//! One tokio task owns the socket, the inbound buffer, the timer table,
//! and the current handler. Everything the handler observes happens on
//! this task: packet dispatch, commands, timer firings, and sender errors
//! are serialized through one message loop, so handler state never needs
//! a lock.

use std::{collections::HashMap, io, sync::Arc, time::Duration};

use bytes::{Buf, BytesMut};
use multiaddr::Multiaddr;
use strand_net_codec::{decode_from, PacketSpec};
use tokio::{
    io::AsyncReadExt,
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    addr,
    error::{Closed, DialError, ExitReason},
    registry::{self, InstanceId, StreamMetadata},
    sender::{self, SenderCommand},
    traits::{
        Action, Active, CommandPayload, HandlerResult, Info, InfoPayload, Kind, ReplyToken,
        ReplyValue, StreamHandler, TimerKey,
    },
    StreamOpts,
};

/// How long a stopping transport waits for its sender to drain.
const SENDER_GRACE: Duration = Duration::from_millis(500);

/// What a transport connects to: an already-connected socket (listener
/// path, muxed sub-stream) or an address to dial.
#[derive(Debug)]
pub enum StreamTarget {
    Socket(TcpStream),
    Addr(Multiaddr),
}

pub(crate) enum StreamMessage {
    Command {
        cmd: CommandPayload,
        reply_tx: oneshot::Sender<ReplyValue>,
    },
    User(InfoPayload),
    TimerFired { key: TimerKey, generation: u64 },
    SenderError(io::Error),
    Kill,
}

/// Cloneable handle to a running transport instance.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: InstanceId,
    tx: mpsc::UnboundedSender<StreamMessage>,
}

impl StreamHandle {
    /// The instance's registry identifier.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Call into the handler's `on_command` and wait for its reply.
    ///
    /// Waits indefinitely: the call resolves when the handler replies
    /// (inline or through a later `Reply` action) and fails with
    /// [`Closed`] once the instance terminates without replying.
    pub async fn command(&self, cmd: CommandPayload) -> Result<ReplyValue, Closed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StreamMessage::Command { cmd, reply_tx })
            .map_err(|_| Closed)?;
        reply_rx.await.map_err(|_| Closed)
    }

    /// Inject a message delivered to the handler as [`Info::User`].
    pub fn info(&self, msg: InfoPayload) -> Result<(), Closed> {
        self.tx.send(StreamMessage::User(msg)).map_err(|_| Closed)
    }

    /// Ask the instance to shut down cleanly.
    pub fn kill(&self) {
        let _ = self.tx.send(StreamMessage::Kill);
    }

    /// `(local, peer)` addresses while the instance is live.
    pub fn addr_info(&self) -> Result<(Multiaddr, Multiaddr), Closed> {
        registry::addr_info(self.id).ok_or(Closed)
    }

    /// Whether the instance has terminated.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the instance has terminated.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Spawn a transport instance and return its handle.
///
/// The handle is live immediately; dial failures surface through the
/// configured [`crate::ErrorSink`], not the return value.
pub fn start(kind: Kind, target: StreamTarget, opts: StreamOpts) -> StreamHandle {
    let id = InstanceId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = StreamHandle { id, tx: tx.clone() };
    tokio::spawn(run(id, kind, target, opts, tx, rx));
    handle
}

async fn run(
    id: InstanceId,
    kind: Kind,
    target: StreamTarget,
    opts: StreamOpts,
    self_tx: mpsc::UnboundedSender<StreamMessage>,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
) {
    let StreamOpts {
        handler,
        error_sink,
        dial_timeout,
    } = opts;

    let socket = match target {
        StreamTarget::Socket(socket) => socket,
        StreamTarget::Addr(addr) => match dial(&addr, dial_timeout).await {
            Ok(socket) => socket,
            Err(error) => {
                debug!(%id, %addr, %error, "dial failed");
                if let Some(sink) = &error_sink {
                    sink.notify(error);
                }
                return;
            }
        },
    };

    let addr_info = match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => Some((addr::to_multiaddr(local), addr::to_multiaddr(peer))),
        _ => None,
    };
    let (read, write) = socket.into_split();
    let (sender_tx, sender_join) = sender::spawn(Box::new(write), self_tx.clone());

    registry::insert(
        id,
        StreamMetadata {
            stack: vec![(handler.protocol_id().to_string(), kind)],
            addr_info,
        },
    );

    let mut transport = Transport {
        id,
        kind,
        handler,
        packet_spec: None,
        active: Active::Off,
        buffer: BytesMut::new(),
        timers: HashMap::new(),
        timer_seq: 0,
        read,
        rx,
        self_tx,
        sender_tx,
        sender_join,
    };

    let reason = transport.run_loop().await;
    transport.shutdown(reason).await;
}

async fn dial(addr: &Multiaddr, dial_timeout: Duration) -> Result<TcpStream, DialError> {
    let socket_addr = addr::socket_addr(addr)?;
    match tokio::time::timeout(dial_timeout, TcpStream::connect(socket_addr)).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(error)) if error.kind() == io::ErrorKind::ConnectionRefused => {
            Err(DialError::Refused)
        }
        Ok(Err(error)) => Err(DialError::Io(error)),
        Err(_) => Err(DialError::Timeout),
    }
}

struct TimerEntry {
    generation: u64,
    task: JoinHandle<()>,
}

struct Transport {
    id: InstanceId,
    kind: Kind,
    handler: Box<dyn StreamHandler>,
    packet_spec: Option<PacketSpec>,
    active: Active,
    buffer: BytesMut,
    timers: HashMap<TimerKey, TimerEntry>,
    timer_seq: u64,
    read: OwnedReadHalf,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    self_tx: mpsc::UnboundedSender<StreamMessage>,
    sender_tx: mpsc::UnboundedSender<SenderCommand>,
    sender_join: JoinHandle<()>,
}

impl Transport {
    async fn run_loop(&mut self) -> ExitReason {
        let init = self.handler.init(self.kind);
        if let Err(reason) = self.apply_result(init).and_then(|()| self.pump()) {
            return reason;
        }

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    // The transport holds its own sender, so the channel
                    // cannot close while the loop runs.
                    let Some(msg) = msg else { return ExitReason::Normal };
                    if let Err(reason) = self.handle_message(msg) {
                        return reason;
                    }
                }
                read = read_chunk(&mut self.read, &mut self.buffer), if self.active != Active::Off => {
                    match read {
                        Ok(0) => return ExitReason::ConnectionClosed,
                        Ok(_) => {
                            if let Err(reason) = self.pump() {
                                return reason;
                            }
                        }
                        Err(error) => return ExitReason::Io(Arc::new(error)),
                    }
                }
                _ = &mut self.sender_join => {
                    warn!(id = %self.id, "sender task exited unexpectedly");
                    return ExitReason::SenderFailed;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: StreamMessage) -> Result<(), ExitReason> {
        match msg {
            StreamMessage::Command { cmd, reply_tx } => {
                let token = ReplyToken::new(reply_tx);
                let result = self.handler.on_command(self.kind, cmd, token);
                self.apply_result(result)?;
            }
            StreamMessage::User(payload) => {
                let result = self.handler.on_info(self.kind, Info::User(payload));
                self.apply_result(result)?;
            }
            StreamMessage::TimerFired { key, generation } => {
                let live =
                    matches!(self.timers.get(&key), Some(entry) if entry.generation == generation);
                if live {
                    self.timers.remove(&key);
                    let result = self.handler.on_info(self.kind, Info::Timeout(key));
                    self.apply_result(result)?;
                } else {
                    debug!(id = %self.id, %key, "discarding cancelled timer");
                }
            }
            StreamMessage::SenderError(error) => {
                let result = self.handler.on_info(self.kind, Info::SendError(error));
                self.apply_result(result)?;
            }
            StreamMessage::Kill => return Err(ExitReason::Normal),
        }
        self.pump()
    }

    /// Dispatch buffered packets while a spec is installed and the
    /// transport is active.
    ///
    /// The loop re-reads `packet_spec` and `active` every iteration, which
    /// is what makes hot re-framing work: a `PacketSpec` action applied by
    /// a callback takes effect on the very next buffered frame, before any
    /// new socket bytes arrive.
    fn pump(&mut self) -> Result<(), ExitReason> {
        loop {
            if self.active == Active::Off {
                return Ok(());
            }
            let Some(spec) = self.packet_spec.clone() else {
                return Ok(());
            };
            match decode_from(&spec, &self.buffer) {
                Ok(Some(head)) => {
                    self.buffer.advance(head.header_len);
                    let payload = self.buffer.split_to(head.payload_len).freeze();
                    if self.active == Active::Once {
                        self.active = Active::Off;
                    }
                    let result = self.handler.on_packet(self.kind, &head.headers, payload);
                    self.apply_result(result)?;
                }
                Ok(None) => return Ok(()),
                Err(error) => return Err(ExitReason::protocol(error)),
            }
        }
    }

    fn apply_result(&mut self, result: HandlerResult) -> Result<(), ExitReason> {
        match result {
            HandlerResult::Continue(actions) => self.apply_actions(actions),
            HandlerResult::Stop(reason, actions) => {
                // Same-batch actions run first so a final send is enqueued
                // before the sender is asked to drain.
                if let Err(inner) = self.apply_actions(actions) {
                    debug!(id = %self.id, %inner, "error while applying stop actions");
                }
                Err(reason)
            }
        }
    }

    fn apply_actions(&mut self, actions: Vec<Action>) -> Result<(), ExitReason> {
        let mut swap: Option<Box<dyn StreamHandler>> = None;
        for action in actions {
            match action {
                Action::Send(data) => {
                    if self.sender_tx.send(SenderCommand::Send(data)).is_err() {
                        warn!(id = %self.id, "no live sender, dropping outbound bytes");
                    }
                }
                Action::PacketSpec(spec) => {
                    if self.packet_spec.as_ref() != Some(&spec) {
                        self.packet_spec = Some(spec);
                    }
                }
                Action::Active(mode) => {
                    self.active = mode;
                }
                Action::Reply(token, value) => token.send(value),
                Action::Timer(key, after) => self.arm_timer(key, after),
                Action::CancelTimer(key) => {
                    if let Some(entry) = self.timers.remove(&key) {
                        entry.task.abort();
                    }
                }
                Action::SendFn(sink) => self.replace_sender(sink),
                Action::Swap(handler) => {
                    if let Some(superseded) = swap.replace(handler) {
                        warn!(
                            id = %self.id,
                            protocol = superseded.protocol_id(),
                            "swap superseded within one action batch"
                        );
                    }
                }
                Action::SwapKind => {
                    self.kind = self.kind.flip();
                    registry::set_top_kind(self.id, self.kind);
                }
            }
        }
        // The swap runs after its batch: earlier sends are already queued,
        // and the new handler's init actions apply before the next message.
        if let Some(handler) = swap {
            self.perform_swap(handler)?;
        }
        Ok(())
    }

    fn perform_swap(&mut self, handler: Box<dyn StreamHandler>) -> Result<(), ExitReason> {
        let old = std::mem::replace(&mut self.handler, handler);
        debug!(
            id = %self.id,
            from = old.protocol_id(),
            to = self.handler.protocol_id(),
            "swapping stream handler"
        );
        drop(old);
        registry::push_stack(self.id, self.handler.protocol_id(), self.kind);
        let result = self.handler.init(self.kind);
        self.apply_result(result)
    }

    fn arm_timer(&mut self, key: TimerKey, after: Duration) {
        self.timer_seq += 1;
        let generation = self.timer_seq;
        if let Some(prev) = self.timers.remove(&key) {
            prev.task.abort();
        }
        let tx = self.self_tx.clone();
        let fired_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(StreamMessage::TimerFired {
                key: fired_key,
                generation,
            });
        });
        self.timers.insert(key, TimerEntry { generation, task });
    }

    fn replace_sender(&mut self, sink: Box<dyn sender::SendFn>) {
        let (tx, join) = sender::spawn(sink, self.self_tx.clone());
        let old_tx = std::mem::replace(&mut self.sender_tx, tx);
        let _old_join = std::mem::replace(&mut self.sender_join, join);
        // The old sender drains its queue, then stops; the ack channel is
        // dropped because nobody waits on a replacement.
        let (ack, _) = oneshot::channel();
        let _ = old_tx.send(SenderCommand::Stop(ack));
    }

    async fn shutdown(mut self, reason: ExitReason) {
        debug!(id = %self.id, %reason, "stream transport shutting down");
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender_tx.send(SenderCommand::Stop(ack_tx)).is_ok()
            && tokio::time::timeout(SENDER_GRACE, ack_rx).await.is_err()
        {
            warn!(id = %self.id, "sender did not stop within the grace period");
            self.sender_join.abort();
        }
        self.handler.on_terminate(self.kind, &reason);
        for entry in self.timers.into_values() {
            entry.task.abort();
        }
        registry::remove(self.id);
    }
}

async fn read_chunk(read: &mut OwnedReadHalf, buffer: &mut BytesMut) -> io::Result<usize> {
    read.read_buf(buffer).await
}
