use std::io::Write;

use crate::lookup::sanitize_display;
use crate::probe::ICMP_HEADER_SIZE;
use crate::state::{
    HostStatsMap, PathStatsMap, PingSession, ProbeResult, Trace, UNSET_MIN_LATENCY_MS,
};

/// Milliseconds per `#` in the latency bar
const BAR_STEP_MS: f64 = 10.0;
/// Longest latency bar
const BAR_MAX_WIDTH: usize = 50;

/// Proportional latency bar, at least one mark for any reply
pub fn latency_bar(latency_ms: f64) -> String {
    let width = (latency_ms / BAR_STEP_MS).ceil().clamp(1.0, BAR_MAX_WIDTH as f64) as usize;
    "#".repeat(width)
}

/// One line per ping reply, ping(8) style with a latency bar
pub fn format_probe_line(result: &ProbeResult) -> String {
    format!(
        "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms |{}",
        result.size + ICMP_HEADER_SIZE,
        result.peer,
        result.sequence,
        result.ttl,
        result.latency_ms,
        latency_bar(result.latency_ms)
    )
}

/// Line printed when a router answered the ping with time-exceeded
pub fn format_router_line(result: &ProbeResult) -> String {
    format!(
        "From {} icmp_seq={} Time to live exceeded",
        result.peer, result.sequence
    )
}

/// Line printed for a ping that got no accepted reply
pub fn format_timeout_line(sequence: u16) -> String {
    format!("Request timeout for icmp_seq {}", sequence)
}

/// One line per hop, `*` for silent hops
pub fn write_trace<W: Write>(trace: &Trace, mut writer: W) -> std::io::Result<()> {
    writeln!(
        writer,
        "trace to {} at {} ({} hops{})",
        trace.target,
        trace.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        trace.len(),
        if trace.reached_destination() { "" } else { ", destination not reached" }
    )?;

    for (i, hop) in trace.hops.iter().enumerate() {
        match hop {
            Some(hop) => writeln!(
                writer,
                "TTL {:2}  {:15}  {:>9.3} ms",
                i + 1,
                hop.peer,
                hop.latency_ms
            )?,
            None => writeln!(writer, "TTL {:2}  *", i + 1)?,
        }
    }

    Ok(())
}

/// Summary block printed periodically and at exit
pub fn write_session_summary<W: Write>(session: &PingSession, mut writer: W) -> std::io::Result<()> {
    writeln!(writer)?;
    writeln!(writer, "--- {} ping statistics ---", session.target)?;
    writeln!(
        writer,
        "{} packets transmitted, {} packets received, {:.1}% packet loss",
        session.transmitted,
        session.received,
        session.loss_pct()
    )?;
    writeln!(
        writer,
        "round-trip min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
        session.min_latency.unwrap_or(0.0),
        session.avg_latency,
        session.max_latency,
        session.stddev()
    )?;
    if let Some(rolling) = session.rolling_avg() {
        writeln!(
            writer,
            "last {} samples avg = {:.3} ms",
            session.recent.len(),
            rolling
        )?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Host statistics table, busiest hosts first
pub fn write_host_table<W: Write>(hosts: &HostStatsMap, mut writer: W) -> std::io::Result<()> {
    writeln!(
        writer,
        "{:<15} {:<40} {:>6} {:>9} {:>9} {:>9} {:>5} {:>5} {:>5}",
        "Host", "Name", "Trips", "Avg", "Min", "Max", ">100", ">400", ">700"
    )?;
    writeln!(writer, "{}", "-".repeat(110))?;

    let mut rows: Vec<_> = hosts.values().collect();
    rows.sort_by(|a, b| b.trip_count.cmp(&a.trip_count));

    for host in rows {
        let name = host.dns_name.as_deref().map(sanitize_display).unwrap_or_default();
        let min = if host.min_latency >= UNSET_MIN_LATENCY_MS {
            "-".to_string()
        } else {
            format!("{:.1}ms", host.min_latency)
        };
        writeln!(
            writer,
            "{:<15} {:<40} {:>6} {:>9} {:>9} {:>9} {:>5} {:>5} {:>5}",
            host.host_name,
            name,
            host.trip_count,
            format!("{:.1}ms", host.avg_latency),
            min,
            format!("{:.1}ms", host.max_latency),
            host.high_latency_100,
            host.high_latency_400,
            host.high_latency_700
        )?;
    }

    Ok(())
}

/// Path statistics, one entry per distinct hop sequence
pub fn write_path_table<W: Write>(paths: &PathStatsMap, mut writer: W) -> std::io::Result<()> {
    for path in paths.values() {
        writeln!(
            writer,
            "{:>4} trips  avg {:>8.1}ms  max-avg {:>8.1}ms  {}",
            path.trip_count, path.avg_latency, path.max_latency_avg, path.path_name
        )?;
    }
    Ok(())
}

/// One line per flagged hop
pub fn write_unhealthy<'a, W: Write>(
    hops: impl IntoIterator<Item = &'a ProbeResult>,
    mut writer: W,
) -> std::io::Result<()> {
    for hop in hops {
        writeln!(
            writer,
            "unhealthy hop: TTL {} {} {:.1}ms (trace to {})",
            hop.ttl, hop.peer, hop.latency_ms, hop.target
        )?;
    }
    Ok(())
}
