//! Single-writer statistics actor.
//!
//! One task owns every statistics map and applies updates in arrival order.
//! Producers hold an [`AggregatorHandle`] and only ever send immutable
//! messages; readers get copies of a map through a request/reply pair, so a
//! snapshot is always taken between two whole updates.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;
use crate::lookup::ReverseResolver;
use crate::state::result::{ProbeResult, Trace, UnhealthyHostRecord};
use crate::state::stats::{HostStats, LatencyBand, PathStats};

/// Nominal depth of every input queue
pub const DEFAULT_QUEUE_DEPTH: usize = 10;
/// Default per-target ping history length
pub const DEFAULT_HISTORY_LIMIT: usize = 3600;

/// Host stats keyed by address
pub type HostStatsMap = BTreeMap<String, HostStats>;
/// Path stats keyed by path name
pub type PathStatsMap = BTreeMap<String, PathStats>;
/// Ping history keyed by target address, oldest first
pub type PingHistory = BTreeMap<String, VecDeque<PingHistoryEntry>>;
/// Most recent trace keyed by target address
pub type TraceMap = BTreeMap<String, Trace>;

/// One ping sample with its presentation band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingHistoryEntry {
    pub band: LatencyBand,
    #[serde(flatten)]
    pub result: ProbeResult,
}

/// Latency sample for one host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostUpdate {
    pub host: Ipv4Addr,
    pub latency_ms: f64,
}

/// Latency sample for one path
#[derive(Debug, Clone, PartialEq)]
pub struct PathUpdate {
    pub path_name: String,
    pub avg_latency: f64,
    pub max_latency: f64,
}

impl PathUpdate {
    /// Path sample from a trace: last responding hop as the path latency,
    /// slowest hop as its max. `None` when no hop answered.
    pub fn from_trace(trace: &Trace) -> Option<Self> {
        Some(Self {
            path_name: trace.path_name(),
            avg_latency: trace.last_latency()?,
            max_latency: trace.max_latency()?,
        })
    }
}

/// Sizing of the aggregator's queues and retained history
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub queue_depth: usize,
    /// Per-target ping history entries and retained unhealthy records
    pub history_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// The statistics themselves. Only the aggregator task holds one.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregatorState {
    pub history: PingHistory,
    pub hosts: HostStatsMap,
    pub paths: PathStatsMap,
    pub traces: TraceMap,
    pub unhealthy: VecDeque<UnhealthyHostRecord>,
    history_limit: usize,
}

impl AggregatorState {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            ..Default::default()
        }
    }

    pub fn record_ping(&mut self, result: ProbeResult) {
        let band = LatencyBand::classify(result.latency_ms);
        let history = self.history.entry(result.target.to_string()).or_default();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(PingHistoryEntry { band, result });
    }

    pub fn record_trace(&mut self, trace: Trace) {
        self.traces.insert(trace.target.to_string(), trace);
    }

    pub fn record_unhealthy(&mut self, hop: ProbeResult) {
        if self.unhealthy.len() >= self.history_limit {
            self.unhealthy.pop_front();
        }
        self.unhealthy.push_back(UnhealthyHostRecord::new(hop));
    }

    pub fn update_path(&mut self, update: PathUpdate) {
        match self.paths.get_mut(&update.path_name) {
            Some(path) => path.record(update.avg_latency, update.max_latency),
            None => {
                let path =
                    PathStats::new(update.path_name.clone(), update.avg_latency, update.max_latency);
                self.paths.insert(update.path_name, path);
            }
        }
    }

    /// Fold a sample into an existing host. Returns false when the host is
    /// new and needs [`AggregatorState::insert_host`] instead.
    pub fn update_known_host(&mut self, update: HostUpdate) -> bool {
        match self.hosts.get_mut(&update.host.to_string()) {
            Some(stats) => {
                stats.record(update.latency_ms);
                true
            }
            None => false,
        }
    }

    pub fn insert_host(&mut self, update: HostUpdate, dns_name: Option<String>) {
        let name = update.host.to_string();
        self.hosts.insert(
            name.clone(),
            HostStats::new(name, dns_name, update.latency_ms),
        );
    }
}

/// Receiving ends of every aggregator channel
struct Inbox {
    pings: mpsc::Receiver<ProbeResult>,
    traces: mpsc::Receiver<Trace>,
    unhealthy: mpsc::Receiver<ProbeResult>,
    paths: mpsc::Receiver<PathUpdate>,
    hosts: mpsc::Receiver<HostUpdate>,
    history_requests: mpsc::Receiver<oneshot::Sender<PingHistory>>,
    path_requests: mpsc::Receiver<oneshot::Sender<PathStatsMap>>,
    host_requests: mpsc::Receiver<oneshot::Sender<HostStatsMap>>,
    trace_requests: mpsc::Receiver<oneshot::Sender<TraceMap>>,
    unhealthy_requests: mpsc::Receiver<oneshot::Sender<Vec<UnhealthyHostRecord>>>,
}

/// Sending side of the aggregator; cheap to clone
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    pings: mpsc::Sender<ProbeResult>,
    traces: mpsc::Sender<Trace>,
    unhealthy: mpsc::Sender<ProbeResult>,
    paths: mpsc::Sender<PathUpdate>,
    hosts: mpsc::Sender<HostUpdate>,
    history_requests: mpsc::Sender<oneshot::Sender<PingHistory>>,
    path_requests: mpsc::Sender<oneshot::Sender<PathStatsMap>>,
    host_requests: mpsc::Sender<oneshot::Sender<HostStatsMap>>,
    trace_requests: mpsc::Sender<oneshot::Sender<TraceMap>>,
    unhealthy_requests: mpsc::Sender<oneshot::Sender<Vec<UnhealthyHostRecord>>>,
}

async fn send<T>(tx: &mpsc::Sender<T>, msg: T) -> Result<(), ProbeError> {
    tx.send(msg).await.map_err(|_| ProbeError::Channel)
}

async fn request<T>(tx: &mpsc::Sender<oneshot::Sender<T>>) -> Result<T, ProbeError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    send(tx, reply_tx).await?;
    reply_rx.await.map_err(|_| ProbeError::Channel)
}

impl AggregatorHandle {
    /// Ping input queue, handed to the prober
    pub fn ping_sender(&self) -> &mpsc::Sender<ProbeResult> {
        &self.pings
    }

    pub async fn record_ping(&self, result: ProbeResult) -> Result<(), ProbeError> {
        send(&self.pings, result).await
    }

    pub async fn record_trace(&self, trace: Trace) -> Result<(), ProbeError> {
        send(&self.traces, trace).await
    }

    pub async fn flag_unhealthy(&self, hop: ProbeResult) -> Result<(), ProbeError> {
        send(&self.unhealthy, hop).await
    }

    pub async fn update_path(&self, update: PathUpdate) -> Result<(), ProbeError> {
        send(&self.paths, update).await
    }

    pub async fn update_host(&self, update: HostUpdate) -> Result<(), ProbeError> {
        send(&self.hosts, update).await
    }

    pub async fn ping_history(&self) -> Result<PingHistory, ProbeError> {
        request(&self.history_requests).await
    }

    pub async fn path_stats(&self) -> Result<PathStatsMap, ProbeError> {
        request(&self.path_requests).await
    }

    pub async fn host_stats(&self) -> Result<HostStatsMap, ProbeError> {
        request(&self.host_requests).await
    }

    pub async fn latest_traces(&self) -> Result<TraceMap, ProbeError> {
        request(&self.trace_requests).await
    }

    pub async fn unhealthy_hosts(&self) -> Result<Vec<UnhealthyHostRecord>, ProbeError> {
        request(&self.unhealthy_requests).await
    }
}

/// The actor: sole owner of [`AggregatorState`]
pub struct Aggregator<R> {
    state: AggregatorState,
    resolver: R,
    inbox: Inbox,
    cancel: CancellationToken,
}

impl<R: ReverseResolver> Aggregator<R> {
    /// Build the actor and the handle that feeds it
    pub fn new(
        config: AggregatorConfig,
        resolver: R,
        cancel: CancellationToken,
    ) -> (Self, AggregatorHandle) {
        let depth = config.queue_depth.max(1);
        let (pings_tx, pings) = mpsc::channel(depth);
        let (traces_tx, traces) = mpsc::channel(depth);
        let (unhealthy_tx, unhealthy) = mpsc::channel(depth);
        let (paths_tx, paths) = mpsc::channel(depth);
        let (hosts_tx, hosts) = mpsc::channel(depth);
        let (history_requests_tx, history_requests) = mpsc::channel(depth);
        let (path_requests_tx, path_requests) = mpsc::channel(depth);
        let (host_requests_tx, host_requests) = mpsc::channel(depth);
        let (trace_requests_tx, trace_requests) = mpsc::channel(depth);
        let (unhealthy_requests_tx, unhealthy_requests) = mpsc::channel(depth);

        let handle = AggregatorHandle {
            pings: pings_tx,
            traces: traces_tx,
            unhealthy: unhealthy_tx,
            paths: paths_tx,
            hosts: hosts_tx,
            history_requests: history_requests_tx,
            path_requests: path_requests_tx,
            host_requests: host_requests_tx,
            trace_requests: trace_requests_tx,
            unhealthy_requests: unhealthy_requests_tx,
        };

        let actor = Self {
            state: AggregatorState::new(config.history_limit),
            resolver,
            inbox: Inbox {
                pings,
                traces,
                unhealthy,
                paths,
                hosts,
                history_requests,
                path_requests,
                host_requests,
                trace_requests,
                unhealthy_requests,
            },
            cancel,
        };

        (actor, handle)
    }

    /// Process messages until cancelled or every handle is dropped.
    /// Returns the final state.
    pub async fn run(mut self) -> AggregatorState {
        tracing::info!("aggregator started");

        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => tracing::debug!("aggregator cancelled"),
            _ = self.process() => tracing::debug!("aggregator inputs closed"),
        }

        tracing::info!(
            hosts = self.state.hosts.len(),
            paths = self.state.paths.len(),
            "aggregator stopped"
        );
        self.state
    }

    /// Apply messages in arrival order until every channel is closed and drained
    async fn process(&mut self) {
        loop {
            // Inputs first: a snapshot reflects every update queued before it
            tokio::select! {
                biased;
                Some(result) = self.inbox.pings.recv() => self.state.record_ping(result),
                Some(trace) = self.inbox.traces.recv() => self.state.record_trace(trace),
                Some(hop) = self.inbox.unhealthy.recv() => self.state.record_unhealthy(hop),
                Some(update) = self.inbox.paths.recv() => self.state.update_path(update),
                Some(update) = self.inbox.hosts.recv() => self.update_host(update).await,
                Some(reply) = self.inbox.history_requests.recv() => {
                    let _ = reply.send(self.state.history.clone());
                }
                Some(reply) = self.inbox.path_requests.recv() => {
                    let _ = reply.send(self.state.paths.clone());
                }
                Some(reply) = self.inbox.host_requests.recv() => {
                    let _ = reply.send(self.state.hosts.clone());
                }
                Some(reply) = self.inbox.trace_requests.recv() => {
                    let _ = reply.send(self.state.traces.clone());
                }
                Some(reply) = self.inbox.unhealthy_requests.recv() => {
                    let _ = reply.send(self.state.unhealthy.iter().cloned().collect());
                }
                else => break,
            }
        }
    }

    async fn update_host(&mut self, update: HostUpdate) {
        if self.state.update_known_host(update) {
            return;
        }

        // First sighting: resolve the display name before creating the record.
        // This holds up the queue, which is fine for a once-per-host lookup.
        let dns_name = match self.resolver.reverse_lookup(IpAddr::V4(update.host)).await {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(host = %update.host, error = %e, "reverse lookup failed");
                None
            }
        };
        self.state.insert_host(update, dns_name);
    }
}

/// Spawn the aggregator task
pub fn spawn_aggregator<R: ReverseResolver>(
    config: AggregatorConfig,
    resolver: R,
    cancel: CancellationToken,
) -> (AggregatorHandle, JoinHandle<AggregatorState>) {
    let (actor, handle) = Aggregator::new(config, resolver, cancel);
    (handle, tokio::spawn(actor.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::result::tests::hop;
    use crate::state::stats::UNSET_MIN_LATENCY_MS;
    use crate::state::{IcmpResponseType, MessageKind};

    const TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    struct FixedName;

    impl ReverseResolver for FixedName {
        async fn reverse_lookup(&self, ip: IpAddr) -> Result<String, ProbeError> {
            match ip {
                IpAddr::V4(v4) if v4 == TARGET => Ok("dns.google".to_string()),
                _ => Err(ProbeError::Lookup {
                    addr: ip.to_string(),
                    reason: "NXDOMAIN".to_string(),
                }),
            }
        }
    }

    fn ping(latency_ms: f64) -> ProbeResult {
        ProbeResult {
            response: IcmpResponseType::EchoReply,
            peer: TARGET,
            ..hop(117, TARGET, latency_ms)
        }
    }

    #[test]
    fn test_ping_history_is_bounded_and_banded() {
        let mut state = AggregatorState::new(2);
        state.record_ping(ping(10.0));
        state.record_ping(ping(50.0));
        state.record_ping(ping(200.0));

        let history = &state.history["8.8.8.8"];
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].band, LatencyBand::Unclassified);
        assert_eq!(history[1].band, LatencyBand::High);
        assert_eq!(history[1].result.latency_ms, 200.0);
    }

    #[test]
    fn test_path_update_creates_then_blends() {
        let mut state = AggregatorState::new(10);
        let update = |avg, max| PathUpdate {
            path_name: "10.0.0.1 > 8.8.8.8".to_string(),
            avg_latency: avg,
            max_latency: max,
        };
        state.update_path(update(10.0, 20.0));
        state.update_path(update(30.0, 60.0));

        let path = &state.paths["10.0.0.1 > 8.8.8.8"];
        assert_eq!(path.trip_count, 2);
        assert_eq!(path.avg_latency, 20.0);
        assert_eq!(path.max_latency_avg, 40.0);
    }

    #[test]
    fn test_path_update_from_trace() {
        let mut trace = Trace::new(TARGET);
        assert_eq!(PathUpdate::from_trace(&trace), None);

        trace.hops.push(Some(hop(1, Ipv4Addr::new(10, 0, 0, 1), 30.0)));
        trace.hops.push(None);
        trace.hops.push(Some(hop(3, TARGET, 12.0)));

        let update = PathUpdate::from_trace(&trace).unwrap();
        assert_eq!(update.path_name, "10.0.0.1 > * > 8.8.8.8");
        assert_eq!(update.avg_latency, 12.0);
        assert_eq!(update.max_latency, 30.0);
    }

    #[tokio::test]
    async fn test_host_updates_through_actor() {
        let cancel = CancellationToken::new();
        let (handle, task) =
            spawn_aggregator(AggregatorConfig::default(), FixedName, cancel.clone());

        for sample in [100.0, 50.0, 200.0] {
            handle
                .update_host(HostUpdate { host: TARGET, latency_ms: sample })
                .await
                .unwrap();
        }
        let router = Ipv4Addr::new(10, 0, 0, 1);
        handle
            .update_host(HostUpdate { host: router, latency_ms: 0.0 })
            .await
            .unwrap();

        let hosts = handle.host_stats().await.unwrap();
        let google = &hosts["8.8.8.8"];
        assert_eq!(google.dns_name.as_deref(), Some("dns.google"));
        assert_eq!(google.avg_latency, 137.5);
        assert_eq!(google.min_latency, 50.0);
        assert_eq!(google.max_latency, 200.0);
        assert_eq!(google.trip_count, 3);

        // Lookup failure still creates the record
        let hop = &hosts["10.0.0.1"];
        assert_eq!(hop.dns_name, None);
        assert_eq!(hop.host_name, "10.0.0.1");
        assert_eq!(hop.min_latency, UNSET_MIN_LATENCY_MS);

        cancel.cancel();
        let state = task.await.unwrap();
        assert_eq!(state.hosts, hosts);
    }

    #[tokio::test]
    async fn test_snapshots_reflect_all_inputs() {
        let cancel = CancellationToken::new();
        let (handle, task) =
            spawn_aggregator(AggregatorConfig::default(), FixedName, cancel.clone());

        handle.record_ping(ping(12.0)).await.unwrap();
        handle.record_ping(ping(80.0)).await.unwrap();

        let mut trace = Trace::new(TARGET);
        trace.hops.push(Some(hop(1, Ipv4Addr::new(10, 0, 0, 1), 2.0)));
        handle.record_trace(trace.clone()).await.unwrap();
        handle
            .flag_unhealthy(hop(4, Ipv4Addr::new(10, 0, 0, 4), 180.0))
            .await
            .unwrap();
        handle
            .update_path(PathUpdate::from_trace(&trace).unwrap())
            .await
            .unwrap();

        let history = handle.ping_history().await.unwrap();
        let bands: Vec<_> = history["8.8.8.8"].iter().map(|e| e.band).collect();
        assert_eq!(bands, vec![LatencyBand::Low, LatencyBand::Elevated]);

        assert_eq!(handle.latest_traces().await.unwrap()["8.8.8.8"], trace);
        assert_eq!(handle.path_stats().await.unwrap()["10.0.0.1"].trip_count, 1);

        let unhealthy = handle.unhealthy_hosts().await.unwrap();
        assert_eq!(unhealthy.len(), 1);
        assert_eq!(unhealthy[0].kind, MessageKind::UnhealthyHost);
        assert_eq!(unhealthy[0].hop.ttl, 4);

        drop(handle);
        // Dropping the last handle ends the actor without cancellation
        let state = task.await.unwrap();
        assert_eq!(state.unhealthy.len(), 1);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_aggregator_reports_channel_error() {
        let cancel = CancellationToken::new();
        let (handle, task) =
            spawn_aggregator(AggregatorConfig::default(), FixedName, cancel.clone());
        cancel.cancel();
        task.await.unwrap();

        assert!(matches!(handle.record_ping(ping(1.0)).await, Err(ProbeError::Channel)));
        assert!(matches!(handle.host_stats().await, Err(ProbeError::Channel)));
    }
}
