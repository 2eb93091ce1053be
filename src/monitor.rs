//! Dispatch loop: fires pings and traces on their timers, prints results as
//! they complete and forwards every observation to the aggregator.

use std::future::Future;
use std::io::Write;
use std::net::Ipv4Addr;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ProbeError;
use crate::export::{
    format_probe_line, format_router_line, format_timeout_line, write_session_summary,
    write_trace, write_unhealthy,
};
use crate::probe::{PingRequest, send_ping};
use crate::state::{
    AggregatorHandle, HostUpdate, IcmpResponseType, NO_REPLY_LATENCY_MS, PathUpdate, PingSession,
    ProbeResult, Trace,
};
use crate::trace::{AnomalyScan, TraceRequest, confirm, scan_hops, ttl_trace};

/// Source of probes. The monitor only sees results, never sockets.
pub trait Prober: Clone + Send + Sync + 'static {
    /// Send one ping; a successful result is also pushed to `results`
    fn ping(
        &self,
        request: PingRequest,
        results: mpsc::Sender<ProbeResult>,
    ) -> impl Future<Output = Result<ProbeResult, ProbeError>> + Send;

    fn trace(&self, request: TraceRequest) -> impl Future<Output = Result<Trace, ProbeError>> + Send;
}

/// Raw-socket ICMP prober
#[derive(Debug, Clone, Copy, Default)]
pub struct IcmpProber;

impl Prober for IcmpProber {
    async fn ping(
        &self,
        request: PingRequest,
        results: mpsc::Sender<ProbeResult>,
    ) -> Result<ProbeResult, ProbeError> {
        send_ping(request, &results).await
    }

    async fn trace(&self, request: TraceRequest) -> Result<Trace, ProbeError> {
        ttl_trace(request).await
    }
}

/// Outcome of one trace tick
#[derive(Debug, Clone)]
pub struct TraceCycle {
    pub trace: Trace,
    pub scan: AnomalyScan,
    /// Confirmation traces that completed
    pub confirmations: usize,
    /// Confirmation traces that peaked above the threshold again
    pub reproduced: usize,
}

/// Hand a completed trace to the aggregator: the trace itself, one host
/// sample per responding hop and one path sample.
pub async fn publish_trace(aggregator: &AggregatorHandle, trace: &Trace) -> Result<(), ProbeError> {
    aggregator.record_trace(trace.clone()).await?;
    for hop in trace.responding() {
        aggregator
            .update_host(HostUpdate {
                host: hop.peer,
                latency_ms: hop.latency_ms,
            })
            .await?;
    }
    if let Some(update) = PathUpdate::from_trace(trace) {
        aggregator.update_path(update).await?;
    }
    Ok(())
}

/// Trace, publish, scan for latency jumps, flag suspicious hops, then
/// re-sample the path when the trace peaked above the threshold.
pub async fn trace_cycle<P: Prober>(
    prober: &P,
    aggregator: &AggregatorHandle,
    config: &Config,
    target: Ipv4Addr,
) -> Result<TraceCycle, ProbeError> {
    let request = config.trace_request(target);
    let threshold = config.anomaly_threshold_ms;

    let trace = prober.trace(request).await?;
    publish_trace(aggregator, &trace).await?;

    let scan = scan_hops(&trace.hops, threshold);
    for hop in &scan.flagged {
        tracing::warn!(
            ttl = hop.ttl,
            peer = %hop.peer,
            latency_ms = hop.latency_ms,
            "potentially unhealthy hop"
        );
        aggregator.flag_unhealthy(hop.clone()).await?;
    }

    let mut cycle = TraceCycle {
        trace,
        scan,
        confirmations: 0,
        reproduced: 0,
    };
    if !cycle.scan.needs_confirmation(threshold) {
        return Ok(cycle);
    }

    tracing::info!(
        high_water_mark = cycle.scan.high_water_mark,
        count = config.confirmation_traces,
        "high latency detected, running confirmation traces"
    );
    let rerun = || async move {
        let trace = prober.trace(request).await?;
        publish_trace(aggregator, &trace).await?;
        Ok::<_, ProbeError>(trace)
    };
    let confirmations =
        confirm(config.confirmation_traces, config.confirmation_spacing, rerun).await;

    cycle.confirmations = confirmations.len();
    cycle.reproduced = confirmations
        .iter()
        .filter(|trace| scan_hops(&trace.hops, threshold).needs_confirmation(threshold))
        .count();
    tracing::info!(
        completed = cycle.confirmations,
        reproduced = cycle.reproduced,
        "confirmation traces finished"
    );

    Ok(cycle)
}

enum TaskOutcome {
    Ping {
        sequence: u16,
        result: Result<ProbeResult, ProbeError>,
    },
    Trace(Result<TraceCycle, ProbeError>),
}

/// Ping/trace dispatcher for one target
pub struct Monitor<P, W> {
    config: Config,
    target: Ipv4Addr,
    prober: P,
    aggregator: AggregatorHandle,
    cancel: CancellationToken,
    out: W,
    session: PingSession,
    sequence: u16,
    sent: u64,
    tasks: JoinSet<TaskOutcome>,
}

impl<P: Prober, W: Write> Monitor<P, W> {
    pub fn new(
        config: Config,
        target: Ipv4Addr,
        prober: P,
        aggregator: AggregatorHandle,
        cancel: CancellationToken,
        out: W,
    ) -> Self {
        Self {
            config,
            target,
            prober,
            aggregator,
            cancel,
            out,
            session: PingSession::new(target),
            sequence: 0,
            sent: 0,
            tasks: JoinSet::new(),
        }
    }

    /// Run until cancelled, or until `count` pings have completed.
    /// Returns the local ping tally.
    pub async fn run(mut self) -> Result<PingSession, ProbeError> {
        tracing::info!(dest = %self.target, "monitor started");

        // First tick after one full period, like a plain ticker
        let mut ping_tick =
            interval_at(Instant::now() + self.config.interval, self.config.interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut trace_tick = interval_at(
            Instant::now() + self.config.trace_interval,
            self.config.trace_interval,
        );
        trace_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ping_tick.tick(), if self.wants_ping() => self.spawn_ping(),
                _ = trace_tick.tick() => self.spawn_trace(),
                Some(joined) = self.tasks.join_next() => {
                    match joined {
                        Ok(outcome) => self.handle(outcome).await?,
                        Err(e) => tracing::error!(error = %e, "probe task failed"),
                    }
                    if self.done() {
                        break;
                    }
                }
            }
        }

        self.tasks.shutdown().await;
        self.out.flush()?;
        tracing::info!(
            dest = %self.target,
            transmitted = self.session.transmitted,
            received = self.session.received,
            "monitor stopped"
        );
        Ok(self.session)
    }

    fn wants_ping(&self) -> bool {
        self.config.count.is_none_or(|count| self.sent < count)
    }

    fn done(&self) -> bool {
        self.config
            .count
            .is_some_and(|count| self.session.transmitted >= count)
    }

    fn spawn_ping(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.sent += 1;

        let sequence = self.sequence;
        let request = self.config.ping_request(self.target, sequence);
        let prober = self.prober.clone();
        let results = self.aggregator.ping_sender().clone();
        self.tasks.spawn(async move {
            let result = prober.ping(request, results).await;
            TaskOutcome::Ping { sequence, result }
        });
    }

    fn spawn_trace(&mut self) {
        let prober = self.prober.clone();
        let aggregator = self.aggregator.clone();
        let config = self.config.clone();
        let target = self.target;
        self.tasks.spawn(async move {
            TaskOutcome::Trace(trace_cycle(&prober, &aggregator, &config, target).await)
        });
    }

    async fn handle(&mut self, outcome: TaskOutcome) -> Result<(), ProbeError> {
        match outcome {
            TaskOutcome::Ping { sequence, result } => self.handle_ping(sequence, result).await,
            TaskOutcome::Trace(Ok(cycle)) => {
                write_trace(&cycle.trace, &mut self.out)?;
                write_unhealthy(&cycle.scan.flagged, &mut self.out)?;
                Ok(())
            }
            TaskOutcome::Trace(Err(ProbeError::Channel)) => Err(ProbeError::Channel),
            TaskOutcome::Trace(Err(e)) => {
                tracing::error!(dest = %self.target, error = %e, "trace failed");
                Ok(())
            }
        }
    }

    async fn handle_ping(
        &mut self,
        sequence: u16,
        result: Result<ProbeResult, ProbeError>,
    ) -> Result<(), ProbeError> {
        let latency_ms = match result {
            // A router answered: a reply arrived, but the sample is degraded
            Ok(result) if matches!(result.response, IcmpResponseType::TimeExceeded(_)) => {
                tracing::debug!(sequence, peer = %result.peer, "ping answered by a router");
                writeln!(self.out, "{}", format_router_line(&result))?;
                self.session.record(NO_REPLY_LATENCY_MS, true);
                NO_REPLY_LATENCY_MS
            }
            Ok(result) => {
                writeln!(self.out, "{}", format_probe_line(&result))?;
                self.session.record(result.latency_ms, true);
                result.latency_ms
            }
            Err(ProbeError::Channel) => return Err(ProbeError::Channel),
            Err(e) => {
                if e.is_timeout() {
                    tracing::debug!(sequence, "ping timed out");
                } else {
                    tracing::warn!(sequence, error = %e, "ping failed");
                }
                writeln!(self.out, "{}", format_timeout_line(sequence))?;
                self.session.record(NO_REPLY_LATENCY_MS, false);
                NO_REPLY_LATENCY_MS
            }
        };

        self.aggregator
            .update_host(HostUpdate {
                host: self.target,
                latency_ms,
            })
            .await?;

        let every = self.config.summary_every;
        if every > 0 && self.session.transmitted % every == 0 {
            write_session_summary(&self.session, &mut self.out)?;
        }
        Ok(())
    }
}
