//! Probe and aggregation error types.
//!
//! Every probe operation returns [`ProbeError`] on failure. Read timeouts are
//! kept distinct here so callers can report them, but downstream statistics
//! only ever see them as the no-reply sentinel latency.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the prober, tracer and lookup layers.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Raw ICMP socket could not be opened or configured.
    #[error("failed to open ICMP socket: {0}")]
    SocketOpen(#[source] io::Error),

    /// Echo request could not be encoded.
    #[error("failed to marshal echo request: {0}")]
    Marshal(String),

    /// Writing the echo request to the socket failed.
    #[error("failed to write echo request: {0}")]
    Write(#[source] io::Error),

    /// No accepted reply arrived before the deadline.
    #[error("no reply within {0:?}")]
    ReadTimeout(Duration),

    /// Reading from the socket failed for a reason other than the deadline.
    #[error("failed to read reply: {0}")]
    Read(#[source] io::Error),

    /// Reply bytes were not a valid ICMP message.
    #[error("malformed reply: {0}")]
    Parse(String),

    /// Reverse DNS lookup failed (non-fatal for aggregation).
    #[error("reverse lookup failed for {addr}: {reason}")]
    Lookup { addr: String, reason: String },

    /// The blocking probe task panicked or was cancelled.
    #[error("probe task failed: {0}")]
    Task(String),

    /// Probe lines or summaries could not be written out.
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),

    /// The aggregator task is no longer accepting messages.
    #[error("aggregator channel closed")]
    Channel,
}

impl ProbeError {
    /// Classify a socket read error: deadline expiry versus a real failure.
    pub fn from_read(err: io::Error, deadline: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::ReadTimeout(deadline),
            _ => Self::Read(err),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_read_classifies_timeouts() {
        let deadline = Duration::from_secs(2);
        let err = ProbeError::from_read(io::Error::from(io::ErrorKind::WouldBlock), deadline);
        assert!(err.is_timeout());

        let err = ProbeError::from_read(io::Error::from(io::ErrorKind::TimedOut), deadline);
        assert!(err.is_timeout());

        let err = ProbeError::from_read(io::Error::from(io::ErrorKind::ConnectionReset), deadline);
        assert!(!err.is_timeout());
        assert!(matches!(err, ProbeError::Read(_)));
    }
}
