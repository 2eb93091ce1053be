//! Single echo request with latency measurement.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::ProbeError;
use crate::probe::icmp::{
    ECHO_REQUEST_TYPE, PING_MARKER, build_echo_request, contains_marker, get_identifier,
    parse_reply, ping_payload,
};
use crate::probe::socket::{IcmpChannel, RawIcmpSocket};
use crate::state::{IcmpResponseType, NO_REPLY_LATENCY_MS, ProbeResult};

/// Per-probe receive deadline
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// TTL used for ping probes
pub const PING_TTL: u8 = 122;

/// Receive buffer size (covers IP header, ICMP header and a padded payload)
pub const RECV_BUFFER_SIZE: usize = 1500;

/// Parameters of one ping probe
#[derive(Debug, Clone, Copy)]
pub struct PingRequest {
    pub target: Ipv4Addr,
    pub sequence: u16,
    /// Requested payload size; raised to the marker length when smaller
    pub size: usize,
    pub timeout: Duration,
}

impl PingRequest {
    pub fn new(target: Ipv4Addr, sequence: u16, size: usize) -> Self {
        Self {
            target,
            sequence,
            size,
            timeout: PROBE_TIMEOUT,
        }
    }
}

/// Send one ping over `channel` and wait for the matching reply.
///
/// Packets that do not parse as ICMP or do not carry the ping marker are
/// discarded until the deadline. A time-exceeded reply is accepted but its
/// latency is replaced by [`NO_REPLY_LATENCY_MS`].
pub fn ping_once<C: IcmpChannel>(
    channel: &mut C,
    request: &PingRequest,
) -> Result<ProbeResult, ProbeError> {
    let (payload, size) = ping_payload(request.size);
    let packet = build_echo_request(get_identifier(), request.sequence, &payload)?;

    channel.set_ttl(PING_TTL)?;

    let deadline = Instant::now() + request.timeout;
    let start = Instant::now();
    channel.send_to(&packet, request.target)?;

    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::ReadTimeout(request.timeout));
        }

        let recv = channel
            .recv(&mut buffer, remaining)
            .map_err(|e| ProbeError::from_read(e, request.timeout))?;
        let data = &buffer[..recv.len];

        let reply = match parse_reply(data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(from = %recv.source, error = %e, "discarding unparseable packet");
                continue;
            }
        };
        // Our own request is looped back when pinging a local address
        if reply.response == IcmpResponseType::Other(ECHO_REQUEST_TYPE)
            || !contains_marker(data, PING_MARKER)
        {
            tracing::debug!(from = %recv.source, "discarding packet without ping marker");
            continue;
        }

        let mut latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        if matches!(reply.response, IcmpResponseType::TimeExceeded(_)) {
            latency_ms = NO_REPLY_LATENCY_MS;
        }

        return Ok(ProbeResult {
            target: request.target,
            latency_ms,
            timestamp: Utc::now().timestamp(),
            response: reply.response,
            size,
            ttl: recv.response_ttl.unwrap_or(reply.ip_ttl),
            sequence: request.sequence,
            peer: recv.source,
        });
    }
}

/// Ping `request.target` over a fresh raw socket and hand the result to the
/// aggregator's ping channel. Returns the measured latency.
///
/// Nothing is emitted when the probe fails.
pub async fn send_ping(
    request: PingRequest,
    results: &mpsc::Sender<ProbeResult>,
) -> Result<ProbeResult, ProbeError> {
    let result = tokio::task::spawn_blocking(move || {
        let mut socket = RawIcmpSocket::open()?;
        ping_once(&mut socket, &request)
    })
    .await
    .map_err(|e| ProbeError::Task(e.to_string()))??;

    results
        .send(result.clone())
        .await
        .map_err(|_| ProbeError::Channel)?;

    Ok(result)
}
