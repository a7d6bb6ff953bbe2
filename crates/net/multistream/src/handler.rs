//! The two-state negotiation machine, run as a stream handler.

use std::fmt;

use bytes::Bytes;
use rand::Rng;
use strand_net_codec::{encode_line, encode_lines, strip_line, PacketSpec};
use strand_net_stream::{
    Action, Active, ExitReason, HandlerResult, Info, Kind, StreamHandler, TimerKey,
};
use tracing::debug;

use crate::{
    error::MultistreamError, MultistreamConfig, Negotiated, ProtocolEntry, PROTOCOL_ID,
};

const HANDSHAKE_TIMER: &str = "handshake_timeout";
const NEGOTIATE_TIMER: &str = "negotiate_timeout";

const LS: &[u8] = b"ls";
const NA: &[u8] = b"na";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Handshake,
    Negotiate,
}

/// `/multistream/1.0.0` protocol selection.
///
/// Installed as a transport's initial handler; once both peers agree on a
/// protocol it swaps the matching entry's handler into its place. Clients
/// propose configured prefixes in order; servers match proposals against
/// the table, answer `ls` with the full listing, and `na` anything
/// unknown.
pub struct MultistreamHandler {
    handlers: Vec<ProtocolEntry>,
    config: MultistreamConfig,
    state: FsmState,
    selected: usize,
}

impl MultistreamHandler {
    /// A negotiator over `handlers`, first match winning, with default
    /// timeouts.
    pub fn new(handlers: Vec<ProtocolEntry>) -> Self {
        Self::with_config(handlers, MultistreamConfig::default())
    }

    /// A negotiator with explicit timeout configuration.
    pub fn with_config(handlers: Vec<ProtocolEntry>, config: MultistreamConfig) -> Self {
        Self {
            handlers,
            config,
            state: FsmState::Handshake,
            selected: 0,
        }
    }

    fn handshake_deadline(&self) -> std::time::Duration {
        self.config.handshake_timeout.unwrap_or_else(|| {
            let jitter = rand::thread_rng().gen_range(0..crate::HANDSHAKE_JITTER.as_millis() as u64);
            crate::HANDSHAKE_FLOOR + std::time::Duration::from_millis(jitter)
        })
    }

    fn stop(error: MultistreamError) -> HandlerResult {
        HandlerResult::Stop(ExitReason::protocol(error), Vec::new())
    }

    fn propose_selected(&self) -> HandlerResult {
        let prefix = self.handlers[self.selected].prefix();
        match encode_line(prefix.as_bytes()) {
            Ok(proposal) => HandlerResult::Continue(vec![
                Action::Send(proposal),
                Action::Active(Active::Once),
            ]),
            Err(error) => Self::stop(error.into()),
        }
    }

    fn on_handshake(&mut self, kind: Kind, line: Bytes) -> HandlerResult {
        if line != PROTOCOL_ID.as_bytes() {
            return Self::stop(MultistreamError::HandshakeMismatch(lossy(&line)));
        }
        self.state = FsmState::Negotiate;
        match kind {
            Kind::Client => {
                self.selected = 0;
                match self.propose_selected() {
                    HandlerResult::Continue(mut actions) => {
                        actions.insert(0, Action::CancelTimer(TimerKey::from(HANDSHAKE_TIMER)));
                        HandlerResult::Continue(actions)
                    }
                    stop => stop,
                }
            }
            Kind::Server => HandlerResult::Continue(vec![Action::Active(Active::Once)]),
        }
    }

    fn on_negotiate_client(&mut self, line: Bytes) -> HandlerResult {
        if line == NA {
            self.selected += 1;
            if self.selected >= self.handlers.len() {
                return Self::stop(MultistreamError::NoHandlers);
            }
            debug!(
                proposing = self.handlers[self.selected].prefix(),
                "server declined, proposing next protocol"
            );
            return self.propose_selected();
        }
        if line == self.handlers[self.selected].prefix().as_bytes() {
            let negotiated = Negotiated {
                protocol: line,
                path: Bytes::new(),
            };
            let handler = self.handlers[self.selected].build(negotiated);
            return HandlerResult::Continue(vec![Action::Swap(handler)]);
        }
        Self::stop(MultistreamError::UnexpectedServerResponse(lossy(&line)))
    }

    fn on_negotiate_server(&mut self, line: Bytes) -> HandlerResult {
        if line == LS {
            let prefixes: Vec<&str> = self.handlers.iter().map(ProtocolEntry::prefix).collect();
            return match encode_lines(&prefixes) {
                Ok(listing) => HandlerResult::Continue(vec![
                    Action::Send(listing),
                    Action::Active(Active::Once),
                ]),
                Err(error) => Self::stop(error.into()),
            };
        }

        let matched = self
            .handlers
            .iter()
            .position(|entry| line.starts_with(entry.prefix().as_bytes()));
        let Some(index) = matched else {
            debug!(line = %lossy(&line), "no handler for proposed protocol");
            return match encode_line(NA) {
                Ok(na) => HandlerResult::Continue(vec![
                    Action::Send(na),
                    Action::Active(Active::Once),
                ]),
                Err(error) => Self::stop(error.into()),
            };
        };

        let echo = match encode_line(&line) {
            Ok(echo) => echo,
            Err(error) => return Self::stop(error.into()),
        };
        let prefix_len = self.handlers[index].prefix().len();
        let negotiated = Negotiated {
            path: line.slice(prefix_len..),
            protocol: line,
        };
        let handler = self.handlers[index].build(negotiated);
        HandlerResult::Continue(vec![
            Action::Send(echo),
            Action::CancelTimer(TimerKey::from(NEGOTIATE_TIMER)),
            Action::Swap(handler),
        ])
    }
}

impl StreamHandler for MultistreamHandler {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn init(&mut self, kind: Kind) -> HandlerResult {
        if self.handlers.is_empty() {
            return Self::stop(MultistreamError::MissingHandlers);
        }
        let header = match encode_line(PROTOCOL_ID.as_bytes()) {
            Ok(header) => header,
            Err(error) => return Self::stop(error.into()),
        };
        let deadline = match kind {
            Kind::Client => Action::Timer(TimerKey::from(HANDSHAKE_TIMER), self.handshake_deadline()),
            Kind::Server => Action::Timer(
                TimerKey::from(NEGOTIATE_TIMER),
                self.config.negotiate_timeout,
            ),
        };
        HandlerResult::Continue(vec![
            Action::PacketSpec(PacketSpec::varint()),
            Action::Send(header),
            Action::Active(Active::Once),
            deadline,
        ])
    }

    fn on_packet(&mut self, kind: Kind, _headers: &[u64], payload: Bytes) -> HandlerResult {
        let line = match strip_line(&payload) {
            Ok(line) => line,
            Err(error) => return Self::stop(error.into()),
        };
        match self.state {
            FsmState::Handshake => self.on_handshake(kind, line),
            FsmState::Negotiate => match kind {
                Kind::Client => self.on_negotiate_client(line),
                Kind::Server => self.on_negotiate_server(line),
            },
        }
    }

    fn on_info(&mut self, kind: Kind, info: Info) -> HandlerResult {
        match info {
            Info::Timeout(key) if key == HANDSHAKE_TIMER && self.state == FsmState::Handshake => {
                Self::stop(MultistreamError::HandshakeTimeout)
            }
            Info::Timeout(key) if key == NEGOTIATE_TIMER => {
                Self::stop(MultistreamError::NegotiateTimeout)
            }
            info => {
                debug!(?kind, ?info, "ignoring info message during negotiation");
                HandlerResult::Continue(Vec::new())
            }
        }
    }
}

impl fmt::Debug for MultistreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultistreamHandler")
            .field("state", &self.state)
            .field("selected", &self.selected)
            .field(
                "prefixes",
                &self
                    .handlers
                    .iter()
                    .map(ProtocolEntry::prefix)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
