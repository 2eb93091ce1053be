use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Latency recorded when no usable reply arrived (timeout, or a ping answered
/// by a router's time-exceeded instead of the target).
pub const NO_REPLY_LATENCY_MS: f64 = 2000.0;

/// ICMP response type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "code", rename_all = "snake_case")]
pub enum IcmpResponseType {
    EchoReply,
    TimeExceeded(u8),
    DestUnreachable(u8),
    /// Any other ICMP type, carried by its raw type number
    Other(u8),
}

impl IcmpResponseType {
    /// Classify from raw ICMP type/code bytes
    pub fn from_type_code(icmp_type: u8, code: u8) -> Self {
        match icmp_type {
            0 => Self::EchoReply,
            3 => Self::DestUnreachable(code),
            11 => Self::TimeExceeded(code),
            other => Self::Other(other),
        }
    }
}

/// Outcome of one echo request: a ping sample or a single trace hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: Ipv4Addr,
    /// Round-trip time in milliseconds, or [`NO_REPLY_LATENCY_MS`]
    pub latency_ms: f64,
    /// Unix timestamp (seconds) of reply receipt
    pub timestamp: i64,
    pub response: IcmpResponseType,
    /// Echo payload size in bytes
    pub size: usize,
    /// Reply TTL for pings, probe TTL for trace hops
    pub ttl: u8,
    pub sequence: u16,
    /// Address the reply came from
    pub peer: Ipv4Addr,
}

impl ProbeResult {
    pub fn is_no_reply(&self) -> bool {
        self.latency_ms >= NO_REPLY_LATENCY_MS
    }
}

/// Discriminator carried by exported records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    HopSequence,
    UnhealthyHost,
    HostStats,
    PathStats,
    PingHistory,
}

/// A hop flagged by the anomaly scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnhealthyHostRecord {
    pub kind: MessageKind,
    #[serde(flatten)]
    pub hop: ProbeResult,
}

impl UnhealthyHostRecord {
    pub fn new(hop: ProbeResult) -> Self {
        Self {
            kind: MessageKind::UnhealthyHost,
            hop,
        }
    }
}

/// Ordered hop list from one escalating-TTL trace.
///
/// `hops[i]` holds the reply for TTL `i + 1`; `None` marks a silent hop. Gaps
/// stay in place so positions always line up with TTLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub target: Ipv4Addr,
    pub started_at: DateTime<Utc>,
    pub hops: Vec<Option<ProbeResult>>,
}

impl Trace {
    pub fn new(target: Ipv4Addr) -> Self {
        Self {
            target,
            started_at: Utc::now(),
            hops: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Hop at a 1-indexed TTL
    pub fn hop(&self, ttl: u8) -> Option<&ProbeResult> {
        if ttl == 0 {
            return None;
        }
        self.hops.get(ttl as usize - 1).and_then(Option::as_ref)
    }

    /// Responding hops, skipping gaps
    pub fn responding(&self) -> impl Iterator<Item = &ProbeResult> {
        self.hops.iter().flatten()
    }

    /// Did the target itself answer with an echo reply?
    pub fn reached_destination(&self) -> bool {
        self.hops.last().and_then(Option::as_ref).is_some_and(|hop| {
            hop.response == IcmpResponseType::EchoReply && hop.peer == self.target
        })
    }

    /// Per-hop latency with gaps as zero
    pub fn latencies(&self) -> Vec<f64> {
        self.hops
            .iter()
            .map(|hop| hop.as_ref().map_or(0.0, |h| h.latency_ms))
            .collect()
    }

    /// Path identity: responder addresses joined in TTL order, `*` for gaps
    pub fn path_name(&self) -> String {
        self.hops
            .iter()
            .map(|hop| match hop {
                Some(h) => h.peer.to_string(),
                None => "*".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" > ")
    }

    /// Latency of the last responding hop
    pub fn last_latency(&self) -> Option<f64> {
        self.responding().last().map(|h| h.latency_ms)
    }

    /// Highest hop latency
    pub fn max_latency(&self) -> Option<f64> {
        self.responding().map(|h| h.latency_ms).reduce(f64::max)
    }
}
