use super::packet::{Decoder, EmbeddedProbe, Reply};
use super::socket::{is_idle, Socket};
use super::state::RequestState;
use super::{Family, LossReason, Outcome, ProbeResult, Targets};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Large enough for any reply on an Ethernet MTU.
const RECV_BUFFER_SIZE: usize = 1500;
/// Wait before retrying a result the full channel did not take.
const SEND_RETRY: Duration = Duration::from_millis(10);
/// Wait after a read error that is not just an empty poll.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Correlates decoded replies with in-flight requests.
pub struct ReplyHandler {
    decoder: Decoder,
    state: Arc<RequestState>,
    targets: Arc<Targets>,
}

impl ReplyHandler {
    pub fn new(decoder: Decoder, state: Arc<RequestState>, targets: Arc<Targets>) -> Self {
        Self {
            decoder,
            state,
            targets,
        }
    }

    pub fn handle(
        &self,
        data: &[u8],
        peer: Option<IpAddr>,
        received_at: Instant,
    ) -> Option<ProbeResult> {
        let reply = match self.decoder.decode(data) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                tracing::trace!(?peer, "ignoring ICMP message not from this engine");
                return None;
            }
            Err(e) => {
                tracing::debug!(?peer, error = %e, "couldn't parse response");
                return None;
            }
        };
        match reply {
            Reply::EchoReply(echo) => {
                let request = self.state.resolve(echo.sequence)?;
                let rtt = received_at.saturating_duration_since(request.sent_at);
                tracing::trace!(
                    sequence = echo.sequence,
                    identifier = request.identifier,
                    ?peer,
                    ?rtt,
                    "echo reply"
                );
                self.targets
                    .attribute(request.target, request.sequence, Outcome::Reply(rtt))
            }
            Reply::TimeExceeded(probe) => self.routing_error(probe, LossReason::TimeExceeded),
            Reply::DestinationUnreachable(probe) => {
                self.routing_error(probe, LossReason::DestinationUnreachable)
            }
            Reply::PacketTooBig(probe) => self.routing_error(probe, LossReason::PacketTooBig),
            Reply::Other(_) => None,
        }
    }

    fn routing_error(&self, probe: EmbeddedProbe, reason: LossReason) -> Option<ProbeResult> {
        match self.state.resolve(probe.sequence) {
            Some(request) => {
                tracing::warn!(
                    addr = %request.target,
                    sequence = request.sequence,
                    identifier = request.identifier,
                    %reason,
                    "probe lost"
                );
                self.targets
                    .attribute(request.target, request.sequence, Outcome::Lost(reason))
            }
            None => {
                tracing::debug!(
                    destination = %probe.destination,
                    sequence = probe.sequence,
                    %reason,
                    "routing error for a probe no longer in flight"
                );
                None
            }
        }
    }
}

/// Blocking read loop of one connection.
pub struct Listener {
    socket: Arc<dyn Socket>,
    handler: ReplyHandler,
    results: mpsc::Sender<ProbeResult>,
    shutdown: CancellationToken,
}

impl Listener {
    pub fn new(
        socket: Arc<dyn Socket>,
        state: Arc<RequestState>,
        targets: Arc<Targets>,
        results: mpsc::Sender<ProbeResult>,
        shutdown: CancellationToken,
    ) -> Self {
        let handler = ReplyHandler::new(socket.decoder(), state, targets);
        Self {
            socket,
            handler,
            results,
            shutdown,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let name = match self.socket.family() {
            Family::V4 => "icmpv4-listener",
            Family::V6 => "icmpv6-listener",
        };
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let family = self.socket.family();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        while !self.shutdown.is_cancelled() {
            let (size, peer) = match self.socket.recv_from(&mut buf) {
                Ok(read) => read,
                Err(e) if is_idle(&e) => continue,
                Err(e) => {
                    tracing::warn!(%family, error = %e, "couldn't read from connection");
                    std::thread::sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            };
            if size == 0 {
                continue;
            }
            let received_at = Instant::now();
            if let Some(result) = self.handler.handle(&buf[..size], peer, received_at) {
                if !self.deliver(result) {
                    break;
                }
            }
        }
        tracing::debug!(%family, "listener stopped");
    }

    /// Hand a result over, waiting while the channel is full. Returns false
    /// once the listener should stop.
    fn deliver(&self, mut result: ProbeResult) -> bool {
        loop {
            match self.results.try_send(result) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if self.shutdown.is_cancelled() {
                        return false;
                    }
                    result = back;
                    std::thread::sleep(SEND_RETRY);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("result channel closed");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ping::packet::test::{echo_reply, ipv4_error, ipv6_error};
    use crate::ping::packet::{encode_echo_request, PROBE_PAYLOAD};
    use crate::ping::state::InFlightRequest;
    use crate::ping::Target;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ID: u16 = 0x5151;
    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 20);

    fn handler(family: Family) -> (ReplyHandler, Arc<RequestState>) {
        let state = Arc::new(RequestState::new());
        let targets: Targets = vec![
            Target::new(LOCALHOST, "localhost").with_tags(vec!["loopback".into()]),
            Target::new(IpAddr::V4(REMOTE), "remote"),
            Target::new(IpAddr::V6(Ipv6Addr::LOCALHOST), "localhost6"),
        ]
        .into_iter()
        .collect();
        let handler = ReplyHandler::new(
            Decoder::new(family, ID, false),
            state.clone(),
            Arc::new(targets),
        );
        (handler, state)
    }

    fn in_flight(state: &RequestState, target: IpAddr, sent_at: Instant) -> u16 {
        let sequence = state.next_sequence();
        state
            .register(InFlightRequest {
                sequence,
                target,
                identifier: ID,
                sent_at,
            })
            .unwrap();
        sequence
    }

    #[test]
    fn echo_reply_resolves_with_rtt() {
        let (handler, state) = handler(Family::V4);
        let sent_at = Instant::now();
        let sequence = in_flight(&state, LOCALHOST, sent_at);
        let reply = echo_reply(
            Family::V4,
            &encode_echo_request(Family::V4, ID, sequence, PROBE_PAYLOAD),
        );

        let result = handler
            .handle(&reply, Some(LOCALHOST), sent_at + Duration::from_millis(3))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.rtt(), Some(Duration::from_millis(3)));
        assert_eq!(result.target.name, "localhost");
        assert_eq!(result.target.tags, vec!["loopback".to_string()]);
        assert!(!state.contains(sequence));
    }

    #[test]
    fn duplicate_reply_is_dropped() {
        let (handler, state) = handler(Family::V4);
        let sent_at = Instant::now();
        let sequence = in_flight(&state, LOCALHOST, sent_at);
        let reply = echo_reply(
            Family::V4,
            &encode_echo_request(Family::V4, ID, sequence, PROBE_PAYLOAD),
        );

        assert!(handler.handle(&reply, Some(LOCALHOST), sent_at).is_some());
        assert!(handler.handle(&reply, Some(LOCALHOST), sent_at).is_none());
    }

    #[test]
    fn foreign_identifier_produces_nothing() {
        let (handler, state) = handler(Family::V4);
        let sequence = in_flight(&state, LOCALHOST, Instant::now());
        let reply = echo_reply(
            Family::V4,
            &encode_echo_request(Family::V4, ID ^ 0xffff, sequence, PROBE_PAYLOAD),
        );

        assert!(handler
            .handle(&reply, Some(LOCALHOST), Instant::now())
            .is_none());
        assert!(state.contains(sequence));
    }

    #[test]
    fn time_exceeded_is_a_loss() {
        let (handler, state) = handler(Family::V4);
        let sequence = in_flight(&state, IpAddr::V4(REMOTE), Instant::now());
        let probe = encode_echo_request(Family::V4, ID, sequence, PROBE_PAYLOAD);
        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let result = handler
            .handle(&ipv4_error(11, 0, REMOTE, &probe), Some(router), Instant::now())
            .unwrap();
        assert_eq!(result.target.name, "remote");
        assert_eq!(result.loss_reason(), Some(LossReason::TimeExceeded));
        assert!(state.is_empty());
    }

    #[test]
    fn ipv6_packet_too_big_is_a_loss() {
        let (handler, state) = handler(Family::V6);
        let sequence = in_flight(&state, IpAddr::V6(Ipv6Addr::LOCALHOST), Instant::now());
        let probe = encode_echo_request(Family::V6, ID, sequence, PROBE_PAYLOAD);

        let result = handler
            .handle(
                &ipv6_error(2, Ipv6Addr::LOCALHOST, &probe),
                None,
                Instant::now(),
            )
            .unwrap();
        assert_eq!(result.target.name, "localhost6");
        assert_eq!(result.loss_reason(), Some(LossReason::PacketTooBig));
    }

    #[test]
    fn unmatched_routing_error_emits_nothing() {
        let (handler, state) = handler(Family::V4);
        let probe = encode_echo_request(Family::V4, ID, 999, PROBE_PAYLOAD);

        let result = handler.handle(&ipv4_error(3, 1, REMOTE, &probe), None, Instant::now());
        assert!(result.is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn garbage_is_dropped() {
        let (handler, state) = handler(Family::V4);
        let sequence = in_flight(&state, LOCALHOST, Instant::now());
        assert!(handler.handle(&[0, 0], None, Instant::now()).is_none());
        assert!(handler
            .handle(&[11, 0, 0, 0, 0, 0, 0, 0, 0x45], None, Instant::now())
            .is_none());
        assert!(state.contains(sequence));
    }

    /// Plays back a fixed series of reads, then stays idle.
    struct ScriptedSocket {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
    }

    impl ScriptedSocket {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
            })
        }
    }

    impl Socket for ScriptedSocket {
        fn family(&self) -> Family {
            Family::V4
        }
        fn identifier(&self) -> u16 {
            ID
        }
        fn header_included(&self) -> bool {
            false
        }
        fn send_to(&self, _packet: &[u8], _addr: IpAddr) -> io::Result<()> {
            Ok(())
        }
        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)> {
            match self.reads.lock().pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), Some(LOCALHOST)))
                }
                Some(Err(e)) => Err(e),
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
            }
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn start(
        socket: Arc<ScriptedSocket>,
        state: Arc<RequestState>,
        results: mpsc::Sender<ProbeResult>,
    ) -> (JoinHandle<()>, CancellationToken) {
        let targets: Targets = vec![Target::new(LOCALHOST, "localhost")]
            .into_iter()
            .collect();
        let shutdown = CancellationToken::new();
        let handle = Listener::new(socket, state, Arc::new(targets), results, shutdown.clone())
            .spawn()
            .unwrap();
        (handle, shutdown)
    }

    fn reply_for(sequence: u16) -> Vec<u8> {
        echo_reply(
            Family::V4,
            &encode_echo_request(Family::V4, ID, sequence, PROBE_PAYLOAD),
        )
    }

    #[test]
    fn read_error_does_not_stop_the_listener() {
        let state = Arc::new(RequestState::new());
        let sequence = in_flight(&state, LOCALHOST, Instant::now());
        let socket = ScriptedSocket::new(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            Ok(reply_for(sequence)),
        ]);
        let (tx, mut rx) = mpsc::channel(4);
        let (handle, shutdown) = start(socket, state.clone(), tx);

        let mut received = None;
        assert!(wait_until(|| {
            received = rx.try_recv().ok();
            received.is_some()
        }));
        let result = received.unwrap();
        assert!(result.is_success());
        assert_eq!(result.sequence, sequence);
        assert!(state.is_empty());

        shutdown.cancel();
        assert!(wait_until(|| handle.is_finished()));
    }

    #[test]
    fn full_channel_does_not_block_shutdown() {
        let state = Arc::new(RequestState::new());
        let sequence = in_flight(&state, LOCALHOST, Instant::now());
        let socket = ScriptedSocket::new(vec![Ok(reply_for(sequence))]);
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(ProbeResult {
            target: Target::new(LOCALHOST, "localhost"),
            sequence: 999,
            outcome: Outcome::Lost(LossReason::NoReply),
        })
        .unwrap();
        let (handle, shutdown) = start(socket, state.clone(), tx);

        // Resolved, now waiting on the full channel.
        assert!(wait_until(|| state.is_empty()));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        shutdown.cancel();
        assert!(wait_until(|| handle.is_finished()));
        handle.join().unwrap();
    }
}
