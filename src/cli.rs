use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::trace::MAX_TRACE_TTL;

/// Continuous ICMP latency monitor with periodic hop-by-hop traces
#[derive(Parser, Debug, Clone)]
#[command(name = "quack")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host (IPv4 address or hostname)
    pub target: String,

    /// Number of pings to send (0 = run until interrupted)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// Ping interval in seconds
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Trace interval in seconds
    #[arg(short = 't', long = "trace-interval", default_value = "30.0")]
    pub trace_interval: f64,

    /// Probe timeout in seconds
    #[arg(long = "timeout", default_value = "2.0")]
    pub timeout: f64,

    /// Echo payload size in bytes (raised to 56 when smaller)
    #[arg(short = 's', long = "size", default_value = "56")]
    pub size: usize,

    /// Maximum TTL for traces
    #[arg(short = 'm', long = "max-ttl", default_value = "63")]
    pub max_ttl: u8,

    /// Depth of each aggregator queue
    #[arg(long = "queue-depth", default_value = "10")]
    pub queue_depth: usize,

    /// Ping history entries kept per target
    #[arg(long = "history", default_value = "3600")]
    pub history_limit: usize,

    /// Print the ping summary every N pings (0 = only at exit)
    #[arg(long = "summary-every", default_value = "30")]
    pub summary_every: u64,

    /// Skip reverse DNS lookups
    #[arg(long = "no-dns")]
    pub no_dns: bool,

    /// Write a JSON snapshot of all statistics to this file on exit
    #[arg(long = "json-out")]
    pub json_out: Option<PathBuf>,
}

impl Args {
    /// Get ping interval as Duration
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    /// Get trace interval as Duration
    pub fn trace_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.trace_interval)
    }

    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if !self.interval.is_finite() || self.interval <= 0.0 {
            return Err("Interval must be positive".into());
        }

        if !self.trace_interval.is_finite() || self.trace_interval <= 0.0 {
            return Err("Trace interval must be positive".into());
        }

        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err("Timeout must be positive".into());
        }

        if self.max_ttl == 0 {
            return Err("Max TTL must be at least 1".into());
        }

        if self.max_ttl > MAX_TRACE_TTL {
            return Err(format!("Max TTL cannot exceed {}", MAX_TRACE_TTL));
        }

        if self.queue_depth == 0 {
            return Err("Queue depth must be at least 1".into());
        }

        if self.history_limit == 0 {
            return Err("History must keep at least 1 entry".into());
        }

        // Echo payload plus ICMP header must fit in one IPv4 packet
        const MAX_PAYLOAD: usize = 65_507 - 8;
        if self.size > MAX_PAYLOAD {
            return Err(format!("Payload size cannot exceed {}", MAX_PAYLOAD));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["quack"];
        argv.extend_from_slice(extra);
        argv.push("8.8.8.8");
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_are_valid() {
        let args = parse(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.interval_duration(), Duration::from_secs(1));
        assert_eq!(args.trace_interval_duration(), Duration::from_secs(30));
        assert_eq!(args.timeout_duration(), Duration::from_secs(2));
        assert!(args.json_out.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse(&["-i", "0"]).validate().is_err());
        assert!(parse(&["-t", "0"]).validate().is_err());
        assert!(parse(&["--timeout", "0"]).validate().is_err());
        assert!(parse(&["-m", "0"]).validate().is_err());
        assert!(parse(&["-m", "64"]).validate().is_err());
        assert!(parse(&["--queue-depth", "0"]).validate().is_err());
        assert!(parse(&["--history", "0"]).validate().is_err());
        assert!(parse(&["-s", "70000"]).validate().is_err());
    }

    #[test]
    fn test_json_out_path() {
        let args = parse(&["--json-out", "/tmp/quack.json"]);
        assert_eq!(args.json_out, Some(PathBuf::from("/tmp/quack.json")));
    }
}
