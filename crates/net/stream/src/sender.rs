//! Async sender: a per-transport task that serializes outbound writes.
//!
//! Decoupling writes from callback execution keeps handler latency off the
//! socket and preserves FIFO send order across handler swaps. Write errors
//! are forwarded to the transport as [`crate::Info::SendError`] and the
//! sender keeps running; a stop request drains the queue first because it
//! rides the same FIFO channel.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::transport::StreamMessage;

/// Write destination for the async sender.
///
/// The default implementation is the transport's own socket write half; a
/// handler installs a different one (a muxed substream, a test capture)
/// with [`crate::Action::SendFn`].
#[async_trait]
pub trait SendFn: Send + 'static {
    /// Write one buffer to the destination in full.
    async fn send(&mut self, data: Bytes) -> std::io::Result<()>;
}

#[async_trait]
impl SendFn for OwnedWriteHalf {
    async fn send(&mut self, data: Bytes) -> std::io::Result<()> {
        self.write_all(&data).await
    }
}

pub(crate) enum SenderCommand {
    Send(Bytes),
    Stop(oneshot::Sender<()>),
}

/// Spawn a sender task writing through `sink`, reporting failures to the
/// transport's message channel.
pub(crate) fn spawn(
    sink: Box<dyn SendFn>,
    events: mpsc::UnboundedSender<StreamMessage>,
) -> (mpsc::UnboundedSender<SenderCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run(rx, sink, events));
    (tx, join)
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<SenderCommand>,
    mut sink: Box<dyn SendFn>,
    events: mpsc::UnboundedSender<StreamMessage>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SenderCommand::Send(data) => {
                if let Err(error) = sink.send(data).await {
                    debug!(%error, "outbound write failed");
                    let _ = events.send(StreamMessage::SenderError(error));
                }
            }
            SenderCommand::Stop(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
    // Channel closed without a stop: the transport is gone, exit quietly.
}
