use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quack::cli::Args;
use quack::config::Config;
use quack::export::{
    Snapshot, export_json_file, write_host_table, write_path_table, write_session_summary,
    write_unhealthy,
};
use quack::lookup::Resolver;
use quack::monitor::{IcmpProber, Monitor};
use quack::probe::check_permissions;
use quack::state::spawn_aggregator;

/// How long the aggregator may take to drain its queues at exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Logs go to stderr, stdout carries probe lines
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Check permissions early
    if let Err(e) = check_permissions() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let target = resolve_target(&args.target)
        .with_context(|| format!("Failed to resolve target: {}", args.target))?;
    let config = Config::from(&args);

    println!(
        "QUACK {} ({}): {} data bytes",
        args.target, target, config.payload_size
    );

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    // The aggregator outlives the monitor so queued updates still land
    let aggregator_cancel = CancellationToken::new();
    let (aggregator, mut aggregator_task) = spawn_aggregator(
        config.aggregator(),
        Resolver::from_enabled(config.dns_enabled),
        aggregator_cancel.clone(),
    );

    let session = Monitor::new(
        config,
        target,
        IcmpProber,
        aggregator,
        cancel,
        std::io::stdout(),
    )
    .run()
    .await?;

    // Every handle is gone now; wait for the queues to drain
    let state = match tokio::time::timeout(SHUTDOWN_GRACE, &mut aggregator_task).await {
        Ok(joined) => joined?,
        Err(_) => {
            tracing::warn!("aggregator did not drain in time, stopping it");
            aggregator_cancel.cancel();
            aggregator_task.await?
        }
    };

    let mut out = std::io::stdout().lock();
    write_session_summary(&session, &mut out)?;
    write_host_table(&state.hosts, &mut out)?;
    if !state.paths.is_empty() {
        writeln!(out, "\nPaths:")?;
        write_path_table(&state.paths, &mut out)?;
    }
    if !state.unhealthy.is_empty() {
        writeln!(out)?;
        write_unhealthy(state.unhealthy.iter().map(|record| &record.hop), &mut out)?;
    }
    out.flush()?;

    if let Some(ref path) = args.json_out {
        let snapshot = Snapshot::from_state(state).with_session(session);
        export_json_file(&snapshot, path)?;
        tracing::info!(path = %path.display(), "snapshot written");
    }

    Ok(())
}

/// Resolve a target to an IPv4 address
fn resolve_target(target: &str) -> Result<Ipv4Addr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => anyhow::bail!("IPv6 targets are not supported"),
        };
    }

    // Resolve hostname, keeping the first IPv4 answer
    format!("{}:0", target)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .context("No IPv4 addresses found for hostname")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal_addresses() {
        assert_eq!(resolve_target("192.0.2.7").unwrap(), Ipv4Addr::new(192, 0, 2, 7));
        assert!(resolve_target("2001:db8::1").is_err());
    }
}
