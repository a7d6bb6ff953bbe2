//! End-to-end transport tests over real sockets.

use std::time::Duration;

use bytes::Bytes;
use strand_net_codec::{encode_packet, LengthField, PacketSpec};
use strand_net_stream::{
    start, start_client, start_server, Action, Active, CommandPayload, ErrorSink, ExitReason,
    HandlerResult, Info, Kind, ReplyToken, StreamHandler, StreamOpts, StreamTarget, TimerKey,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

fn u8_spec() -> PacketSpec {
    PacketSpec::new(vec![LengthField::U8])
}

fn frame(payload: &[u8]) -> Bytes {
    encode_packet(&u8_spec(), &[], payload).unwrap()
}

/// Replies `"hello"` once and stops straight from `init`.
struct HelloAndStop;

impl StreamHandler for HelloAndStop {
    fn protocol_id(&self) -> &'static str {
        "/hello/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Stop(ExitReason::Normal, vec![Action::Send(frame(b"hello"))])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], _payload: Bytes) -> HandlerResult {
        HandlerResult::Continue(Vec::new())
    }
}

#[tokio::test]
async fn test_init_stop_flushes_final_send() {
    init_tracing();
    let (mut raw, adopted) = socket_pair().await;
    start_server(adopted, StreamOpts::new(Box::new(HelloAndStop)));

    let mut received = Vec::new();
    raw.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, frame(b"hello"));
}

/// Echoes one framed packet per arming; a command re-arms delivery.
struct EchoOnce;

impl StreamHandler for EchoOnce {
    fn protocol_id(&self) -> &'static str {
        "/echo-once/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::PacketSpec(u8_spec()),
            Action::Active(Active::Once),
        ])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], payload: Bytes) -> HandlerResult {
        HandlerResult::Continue(vec![Action::Send(frame(&payload))])
    }

    fn on_command(
        &mut self,
        _kind: Kind,
        _cmd: CommandPayload,
        token: ReplyToken,
    ) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::Active(Active::Once),
            Action::Reply(token, Box::new(())),
        ])
    }
}

#[tokio::test]
async fn test_active_once_reverts_until_rearmed() {
    init_tracing();
    let (mut raw, adopted) = socket_pair().await;
    let handle = start_server(adopted, StreamOpts::new(Box::new(EchoOnce)));

    raw.write_all(&frame(b"hello")).await.unwrap();
    let mut echo = [0u8; 6];
    raw.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, frame(b"hello").as_ref());

    // Delivery disarmed itself: a second frame sits undispatched.
    raw.write_all(&frame(b"again")).await.unwrap();
    let undelivered = timeout(Duration::from_millis(200), raw.read_exact(&mut echo)).await;
    assert!(undelivered.is_err(), "echo arrived while inactive");

    // Re-arming through a command releases the buffered frame.
    handle.command(Box::new("rearm")).await.unwrap();
    raw.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, frame(b"again").as_ref());
}

/// First stage of the swap test: sends a marker, then swaps itself out.
struct SwapOut {
    probe: mpsc::UnboundedSender<Bytes>,
}

impl StreamHandler for SwapOut {
    fn protocol_id(&self) -> &'static str {
        "/swap-out/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::PacketSpec(u8_spec()),
            Action::Active(Active::Once),
        ])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], _payload: Bytes) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::Send(Bytes::from_static(b"from-old")),
            Action::Swap(Box::new(SwappedIn {
                probe: self.probe.clone(),
            })),
        ])
    }
}

/// Second stage: proves its init actions ran on the same live socket.
struct SwappedIn {
    probe: mpsc::UnboundedSender<Bytes>,
}

impl StreamHandler for SwappedIn {
    fn protocol_id(&self) -> &'static str {
        "/swapped-in/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::Send(Bytes::from_static(b"from-new")),
            Action::Active(Active::Once),
        ])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], payload: Bytes) -> HandlerResult {
        let _ = self.probe.send(payload);
        HandlerResult::Continue(Vec::new())
    }
}

#[tokio::test]
async fn test_live_swap_preserves_socket_and_send_order() {
    init_tracing();
    let (mut raw, adopted) = socket_pair().await;
    let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
    let handle = start_server(
        adopted,
        StreamOpts::new(Box::new(SwapOut { probe: probe_tx })),
    );

    raw.write_all(&frame(b"go")).await.unwrap();

    // Bytes sent before the swap come out ahead of the new init's send.
    let mut markers = [0u8; 16];
    raw.read_exact(&mut markers).await.unwrap();
    assert_eq!(&markers, b"from-oldfrom-new");

    // The swapped-in handler is live on the same connection.
    raw.write_all(&frame(b"post-swap")).await.unwrap();
    let seen = timeout(Duration::from_secs(1), probe_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.as_ref(), b"post-swap");

    let stack = strand_net_stream::registry::stack(handle.id()).unwrap();
    let names: Vec<&str> = stack.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["/swap-out/1.0.0", "/swapped-in/1.0.0"]);
}

#[tokio::test]
async fn test_dial_refused_notifies_error_sink() {
    init_tracing();
    // Bind to learn a free port, then close the listener before dialing.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    start_client(
        strand_net_stream::to_multiaddr(addr),
        StreamOpts::new(Box::new(HelloAndStop)).with_error_sink(ErrorSink::new("t", err_tx)),
    );

    let event = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.tag, "t");
    assert!(
        matches!(event.error, strand_net_stream::DialError::Refused),
        "unexpected dial error: {:?}",
        event.error
    );
}

#[tokio::test]
async fn test_dial_invalid_address_notifies_error_sink() {
    init_tracing();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    start_client(
        "/ip4/127.0.0.1/udp/9".parse().unwrap(),
        StreamOpts::new(Box::new(HelloAndStop)).with_error_sink(ErrorSink::new("t", err_tx)),
    );

    let event = timeout(Duration::from_secs(1), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event.error,
        strand_net_stream::DialError::InvalidAddress(_)
    ));
}

/// Arms overlapping and cancelled timers, reporting every firing.
struct TimerRig {
    probe: mpsc::UnboundedSender<TimerKey>,
}

impl StreamHandler for TimerRig {
    fn protocol_id(&self) -> &'static str {
        "/timer-rig/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::Timer(TimerKey::from("dup"), Duration::from_millis(150)),
            Action::Timer(TimerKey::from("dup"), Duration::from_millis(40)),
            Action::Timer(TimerKey::from("gone"), Duration::from_millis(40)),
            Action::CancelTimer(TimerKey::from("gone")),
        ])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], _payload: Bytes) -> HandlerResult {
        HandlerResult::Continue(Vec::new())
    }

    fn on_info(&mut self, _kind: Kind, info: Info) -> HandlerResult {
        if let Info::Timeout(key) = info {
            let _ = self.probe.send(key);
        }
        HandlerResult::Continue(Vec::new())
    }
}

#[tokio::test]
async fn test_timer_rearm_replaces_and_cancel_suppresses() {
    init_tracing();
    let (_raw, adopted) = socket_pair().await;
    let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
    start_server(adopted, StreamOpts::new(Box::new(TimerRig { probe: probe_tx })));

    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut fired = Vec::new();
    while let Ok(key) = probe_rx.try_recv() {
        fired.push(key);
    }
    assert_eq!(fired, vec![TimerKey::from("dup")]);
}

/// Parks the command token until an injected message releases it.
struct ParkedReply {
    parked: Option<ReplyToken>,
}

impl StreamHandler for ParkedReply {
    fn protocol_id(&self) -> &'static str {
        "/parked/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(Vec::new())
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], _payload: Bytes) -> HandlerResult {
        HandlerResult::Continue(Vec::new())
    }

    fn on_command(
        &mut self,
        _kind: Kind,
        _cmd: CommandPayload,
        token: ReplyToken,
    ) -> HandlerResult {
        self.parked = Some(token);
        HandlerResult::Continue(Vec::new())
    }

    fn on_info(&mut self, _kind: Kind, _info: Info) -> HandlerResult {
        match self.parked.take() {
            Some(token) => {
                HandlerResult::Continue(vec![Action::Reply(token, Box::new("released"))])
            }
            None => HandlerResult::Continue(Vec::new()),
        }
    }
}

#[tokio::test]
async fn test_parked_command_released_by_later_reply() {
    init_tracing();
    let (_raw, adopted) = socket_pair().await;
    let handle = start_server(adopted, StreamOpts::new(Box::new(ParkedReply { parked: None })));

    let caller = handle.clone();
    let pending = tokio::spawn(async move { caller.command(Box::new("ask")).await });

    // Give the command time to park, then poke the handler.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.info(Box::new("poke")).unwrap();

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(*reply.downcast::<&str>().unwrap(), "released");
}

#[tokio::test]
async fn test_parked_command_fails_when_instance_dies() {
    init_tracing();
    let (_raw, adopted) = socket_pair().await;
    let handle = start_server(adopted, StreamOpts::new(Box::new(ParkedReply { parked: None })));

    let caller = handle.clone();
    let pending = tokio::spawn(async move { caller.command(Box::new("ask")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.kill();

    assert!(pending.await.unwrap().is_err());
}

#[tokio::test]
async fn test_addr_info_lifecycle() {
    init_tracing();
    let (raw, adopted) = socket_pair().await;
    let local = adopted.local_addr().unwrap();
    let peer = adopted.peer_addr().unwrap();
    let handle = start_server(adopted, StreamOpts::new(Box::new(ParkedReply { parked: None })));

    // The entry appears once the actor has registered itself.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (local_ma, peer_ma) = handle.addr_info().unwrap();
    assert_eq!(local_ma, strand_net_stream::to_multiaddr(local));
    assert_eq!(peer_ma, strand_net_stream::to_multiaddr(peer));

    handle.kill();
    handle.closed().await;
    assert!(handle.addr_info().is_err());
    drop(raw);
}

/// Stops with the peer-supplied reason when told to.
struct StopOnPacket;

impl StreamHandler for StopOnPacket {
    fn protocol_id(&self) -> &'static str {
        "/stop-on-packet/1.0.0"
    }

    fn init(&mut self, _kind: Kind) -> HandlerResult {
        HandlerResult::Continue(vec![
            Action::PacketSpec(u8_spec()),
            Action::Active(Active::On),
        ])
    }

    fn on_packet(&mut self, _kind: Kind, _headers: &[u64], payload: Bytes) -> HandlerResult {
        HandlerResult::Stop(ExitReason::Normal, vec![Action::Send(payload)])
    }
}

#[tokio::test]
async fn test_client_over_adopted_socket() {
    init_tracing();
    // A muxed sub-stream is adopted the same way: client kind, socket target.
    let (mut raw, adopted) = socket_pair().await;
    let handle = start(
        Kind::Client,
        StreamTarget::Socket(adopted),
        StreamOpts::new(Box::new(StopOnPacket)),
    );

    raw.write_all(&frame(b"bye")).await.unwrap();
    let mut echoed = [0u8; 3];
    raw.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"bye");

    handle.closed().await;
    assert!(handle.is_closed());
}
