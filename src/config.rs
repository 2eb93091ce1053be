use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::cli::Args;
use crate::probe::{MIN_PAYLOAD_SIZE, PROBE_TIMEOUT, PingRequest};
use crate::state::{AggregatorConfig, DEFAULT_HISTORY_LIMIT, DEFAULT_QUEUE_DEPTH};
use crate::trace::{
    ANOMALY_THRESHOLD_MS, CONFIRMATION_SPACING, CONFIRMATION_TRACES, MAX_TRACE_TTL, TraceRequest,
};

/// Pings between two printed session summaries
pub const DEFAULT_SUMMARY_EVERY: u64 = 30;

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of pings to send (None = run until interrupted)
    pub count: Option<u64>,
    /// Interval between pings
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Interval between traces
    #[serde(with = "duration_serde")]
    pub trace_interval: Duration,
    /// Per-probe and per-hop receive deadline
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Echo payload size in bytes
    pub payload_size: usize,
    pub max_ttl: u8,
    /// Depth of each aggregator queue
    pub queue_depth: usize,
    /// Ping history entries kept per target
    pub history_limit: usize,
    pub anomaly_threshold_ms: f64,
    pub confirmation_traces: usize,
    #[serde(with = "duration_serde")]
    pub confirmation_spacing: Duration,
    /// Print the session summary every N pings (0 = only at exit)
    pub summary_every: u64,
    /// Enable reverse DNS lookups
    pub dns_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count: None,
            interval: Duration::from_secs(1),
            trace_interval: Duration::from_secs(30),
            timeout: PROBE_TIMEOUT,
            payload_size: MIN_PAYLOAD_SIZE,
            max_ttl: MAX_TRACE_TTL,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            history_limit: DEFAULT_HISTORY_LIMIT,
            anomaly_threshold_ms: ANOMALY_THRESHOLD_MS,
            confirmation_traces: CONFIRMATION_TRACES,
            confirmation_spacing: CONFIRMATION_SPACING,
            summary_every: DEFAULT_SUMMARY_EVERY,
            dns_enabled: true,
        }
    }
}

impl Config {
    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            queue_depth: self.queue_depth,
            history_limit: self.history_limit,
        }
    }

    pub fn ping_request(&self, target: Ipv4Addr, sequence: u16) -> PingRequest {
        PingRequest {
            timeout: self.timeout,
            ..PingRequest::new(target, sequence, self.payload_size)
        }
    }

    pub fn trace_request(&self, target: Ipv4Addr) -> TraceRequest {
        TraceRequest {
            max_ttl: self.max_ttl,
            timeout: self.timeout,
            ..TraceRequest::new(target)
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            count: if args.count == 0 { None } else { Some(args.count) },
            interval: args.interval_duration(),
            trace_interval: args.trace_interval_duration(),
            timeout: args.timeout_duration(),
            payload_size: args.size.max(MIN_PAYLOAD_SIZE),
            max_ttl: args.max_ttl,
            queue_depth: args.queue_depth,
            history_limit: args.history_limit,
            summary_every: args.summary_every,
            dns_enabled: !args.no_dns,
            ..Self::default()
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
