use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::ProbeError;
use crate::probe::{
    ECHO_REQUEST_TYPE, IcmpChannel, PING_MARKER, PROBE_TIMEOUT, RECV_BUFFER_SIZE, RawIcmpSocket,
    TRACE_MARKER, build_echo_request, contains_marker, get_identifier, parse_reply,
};
use crate::state::{IcmpResponseType, ProbeResult, Trace};

/// Highest TTL a trace will try
pub const MAX_TRACE_TTL: u8 = 63;

/// Parameters of one escalating-TTL trace
#[derive(Debug, Clone, Copy)]
pub struct TraceRequest {
    pub target: Ipv4Addr,
    pub max_ttl: u8,
    /// Per-hop receive deadline
    pub timeout: Duration,
}

impl TraceRequest {
    pub fn new(target: Ipv4Addr) -> Self {
        Self {
            target,
            max_ttl: MAX_TRACE_TTL,
            timeout: PROBE_TIMEOUT,
        }
    }
}

/// Probe TTL 1..=max_ttl over `channel`, one echo request per hop.
///
/// Silent hops stay in the result as `None`. The trace stops early once the
/// target itself answers with an echo reply.
pub fn trace_route<C: IcmpChannel>(
    channel: &mut C,
    request: &TraceRequest,
) -> Result<Trace, ProbeError> {
    let identifier = get_identifier();
    let max_ttl = request.max_ttl.clamp(1, MAX_TRACE_TTL);
    let mut trace = Trace::new(request.target);
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    for ttl in 1..=max_ttl {
        let packet = build_echo_request(identifier, ttl as u16, TRACE_MARKER)?;
        channel.set_ttl(ttl)?;

        let deadline = Instant::now() + request.timeout;
        let start = Instant::now();
        channel.send_to(&packet, request.target)?;

        let hop = await_hop(channel, &mut buffer, request, ttl, start, deadline);
        let reached = hop.as_ref().is_some_and(|h| {
            h.response == IcmpResponseType::EchoReply && h.peer == request.target
        });
        trace.hops.push(hop);

        if reached {
            tracing::debug!(dest = %request.target, ttl, "destination reached");
            break;
        }
    }

    Ok(trace)
}

/// Wait for the reply to the probe sent at `ttl`; `None` leaves a gap.
fn await_hop<C: IcmpChannel>(
    channel: &mut C,
    buffer: &mut [u8],
    request: &TraceRequest,
    ttl: u8,
    start: Instant,
    deadline: Instant,
) -> Option<ProbeResult> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(ttl, "hop silent");
            return None;
        }

        let recv = match channel.recv(buffer, remaining) {
            Ok(recv) => recv,
            Err(e) => {
                let err = ProbeError::from_read(e, request.timeout);
                if !err.is_timeout() {
                    tracing::warn!(ttl, error = %err, "trace read failed");
                }
                return None;
            }
        };
        let data = &buffer[..recv.len];

        // Replies to concurrently running pings share the socket type
        if contains_marker(data, PING_MARKER) {
            tracing::debug!(ttl, from = %recv.source, "discarding ping reply during trace");
            continue;
        }

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let reply = match parse_reply(data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(ttl, from = %recv.source, error = %e, "unparseable hop reply");
                return None;
            }
        };

        let hop = ProbeResult {
            target: request.target,
            latency_ms,
            timestamp: Utc::now().timestamp(),
            response: reply.response,
            size: TRACE_MARKER.len(),
            ttl,
            sequence: ttl as u16,
            peer: recv.source,
        };

        match reply.response {
            IcmpResponseType::EchoReply | IcmpResponseType::TimeExceeded(_) => return Some(hop),
            IcmpResponseType::DestUnreachable(code) => {
                tracing::warn!(ttl, from = %recv.source, code, "destination unreachable");
                return None;
            }
            // Our own request is looped back when tracing a local address
            IcmpResponseType::Other(ECHO_REQUEST_TYPE) => continue,
            IcmpResponseType::Other(icmp_type) => {
                tracing::debug!(ttl, from = %recv.source, icmp_type, "unexpected reply type");
                return None;
            }
        }
    }
}

/// Run a trace over a fresh raw socket on the blocking pool
pub async fn ttl_trace(request: TraceRequest) -> Result<Trace, ProbeError> {
    tokio::task::spawn_blocking(move || {
        let mut socket = RawIcmpSocket::open()?;
        trace_route(&mut socket, &request)
    })
    .await
    .map_err(|e| ProbeError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::RecvResult;
    use crate::probe::icmp::tests::{icmp_message, ipv4_packet};
    use std::collections::{HashMap, VecDeque};
    use std::io;

    const TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    /// Answers each TTL from a per-hop script; unscripted hops stay silent
    #[derive(Default)]
    struct HopScript {
        script: HashMap<u8, Vec<(Vec<u8>, Ipv4Addr)>>,
        ttl: u8,
        queue: VecDeque<(Vec<u8>, Ipv4Addr)>,
        sends: usize,
    }

    impl HopScript {
        fn reply(mut self, ttl: u8, packet: Vec<u8>, from: Ipv4Addr) -> Self {
            self.script.entry(ttl).or_default().push((packet, from));
            self
        }

        fn router(self, ttl: u8) -> Self {
            let quoted = icmp_message(8, 0, &[0u8; 8]);
            let packet = ipv4_packet(250, &icmp_message(11, 0, &ipv4_packet(1, &quoted)));
            self.reply(ttl, packet, Ipv4Addr::new(10, 0, 0, ttl))
        }
    }

    impl IcmpChannel for HopScript {
        fn set_ttl(&mut self, ttl: u8) -> Result<(), ProbeError> {
            self.ttl = ttl;
            Ok(())
        }

        fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> Result<usize, ProbeError> {
            assert_eq!(target, TARGET);
            assert!(contains_marker(packet, TRACE_MARKER));
            self.sends += 1;
            self.queue = self.script.remove(&self.ttl).unwrap_or_default().into();
            Ok(packet.len())
        }

        fn recv(&mut self, buffer: &mut [u8], _timeout: Duration) -> io::Result<RecvResult> {
            let (packet, source) = self
                .queue
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
            buffer[..packet.len()].copy_from_slice(&packet);
            Ok(RecvResult {
                len: packet.len(),
                source,
                response_ttl: None,
            })
        }
    }

    fn echo_reply_from_target() -> Vec<u8> {
        ipv4_packet(117, &icmp_message(0, 0, TRACE_MARKER))
    }

    #[test]
    fn test_silent_path_yields_all_gaps() {
        let mut channel = HopScript::default();
        let trace = trace_route(&mut channel, &TraceRequest::new(TARGET)).unwrap();

        assert_eq!(trace.len(), 63);
        assert!(trace.hops.iter().all(Option::is_none));
        assert_eq!(channel.sends, 63);
        assert!(!trace.reached_destination());
    }

    #[test]
    fn test_trace_stops_when_target_replies() {
        let mut channel = HopScript::default()
            .router(1)
            .router(2)
            .router(4)
            .reply(5, echo_reply_from_target(), TARGET);

        let trace = trace_route(&mut channel, &TraceRequest::new(TARGET)).unwrap();

        assert_eq!(trace.len(), 5);
        assert_eq!(channel.sends, 5);
        assert!(trace.hops[2].is_none(), "silent hop 3 keeps its slot");
        assert_eq!(trace.hop(4).map(|h| h.peer), Some(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!(
            trace.hop(1).map(|h| h.response),
            Some(IcmpResponseType::TimeExceeded(0))
        );
        let last = trace.hop(5).unwrap();
        assert_eq!(last.response, IcmpResponseType::EchoReply);
        assert_eq!(last.ttl, 5);
        assert_eq!(last.sequence, 5);
        assert!(trace.reached_destination());
    }

    #[test]
    fn test_trace_discards_ping_replies() {
        let ping_reply = ipv4_packet(117, &icmp_message(0, 0, PING_MARKER));
        let mut channel = HopScript::default()
            .reply(1, ping_reply, TARGET)
            .reply(1, echo_reply_from_target(), TARGET);

        let trace = trace_route(&mut channel, &TraceRequest::new(TARGET)).unwrap();

        assert_eq!(trace.len(), 1);
        assert!(trace.reached_destination());
    }

    #[test]
    fn test_unreachable_and_garbage_leave_gaps() {
        let unreachable = ipv4_packet(64, &icmp_message(3, 1, &[0u8; 28]));
        let mut channel = HopScript::default()
            .router(1)
            .reply(2, unreachable, Ipv4Addr::new(10, 0, 0, 2))
            .reply(3, vec![0x45, 0x00], Ipv4Addr::new(10, 0, 0, 3))
            .reply(4, echo_reply_from_target(), TARGET);

        let trace = trace_route(&mut channel, &TraceRequest::new(TARGET)).unwrap();

        assert_eq!(trace.len(), 4);
        assert!(trace.hops[0].is_some());
        assert!(trace.hops[1].is_none());
        assert!(trace.hops[2].is_none());
        assert!(trace.reached_destination());
    }

    #[test]
    fn test_echo_reply_from_other_host_does_not_stop() {
        let other = Ipv4Addr::new(192, 0, 2, 1);
        let mut channel = HopScript::default()
            .reply(1, ipv4_packet(64, &icmp_message(0, 0, TRACE_MARKER)), other);
        let request = TraceRequest {
            max_ttl: 3,
            ..TraceRequest::new(TARGET)
        };

        let trace = trace_route(&mut channel, &request).unwrap();

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.hop(1).map(|h| h.peer), Some(other));
        assert!(!trace.reached_destination());
    }
}
