use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::Ipv4Addr;

use crate::state::stats::blend;

/// Size of the rolling latency window
pub const ROLLING_WINDOW: usize = 30;

/// Local ping tally kept by the dispatch loop for the periodic summary.
///
/// This is presentation state owned by one task; the shared statistics live in
/// the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSession {
    pub target: Ipv4Addr,
    pub transmitted: u64,
    pub received: u64,
    pub min_latency: Option<f64>,
    pub max_latency: f64,
    /// Blended average, same estimator as the host stats
    pub avg_latency: f64,

    // Welford's online algorithm for the stddev line
    mean: f64,
    m2: f64,

    /// Most recent samples, oldest first
    pub recent: VecDeque<f64>,
}

impl PingSession {
    pub fn new(target: Ipv4Addr) -> Self {
        Self {
            target,
            transmitted: 0,
            received: 0,
            min_latency: None,
            max_latency: 0.0,
            avg_latency: 0.0,
            mean: 0.0,
            m2: 0.0,
            recent: VecDeque::with_capacity(ROLLING_WINDOW),
        }
    }

    /// Record a sample. `replied` is false when the probe failed and the
    /// sample is the no-reply sentinel.
    pub fn record(&mut self, latency_ms: f64, replied: bool) {
        self.transmitted += 1;
        if replied {
            self.received += 1;
        }

        self.avg_latency = if self.transmitted == 1 {
            latency_ms
        } else {
            blend(self.avg_latency, latency_ms)
        };

        if self.min_latency.is_none_or(|min| latency_ms < min) {
            self.min_latency = Some(latency_ms);
        }
        if latency_ms > self.max_latency {
            self.max_latency = latency_ms;
        }

        let delta = latency_ms - self.mean;
        self.mean += delta / self.transmitted as f64;
        self.m2 += delta * (latency_ms - self.mean);

        if self.recent.len() == ROLLING_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(latency_ms);
    }

    /// Loss percentage
    pub fn loss_pct(&self) -> f64 {
        if self.transmitted == 0 {
            0.0
        } else {
            (self.transmitted - self.received) as f64 / self.transmitted as f64 * 100.0
        }
    }

    /// Population standard deviation of all samples
    pub fn stddev(&self) -> f64 {
        if self.transmitted < 2 {
            return 0.0;
        }
        (self.m2 / self.transmitted as f64).sqrt()
    }

    /// Mean of the rolling window
    pub fn rolling_avg(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        Some(self.recent.iter().sum::<f64>() / self.recent.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PingSession {
        PingSession::new(Ipv4Addr::new(8, 8, 8, 8))
    }

    #[test]
    fn test_session_initial_state() {
        let session = session();
        assert_eq!(session.transmitted, 0);
        assert_eq!(session.loss_pct(), 0.0);
        assert_eq!(session.stddev(), 0.0);
        assert_eq!(session.rolling_avg(), None);
        assert_eq!(session.min_latency, None);
    }

    #[test]
    fn test_session_counts_loss() {
        let mut session = session();
        session.record(10.0, true);
        session.record(2000.0, false);
        session.record(20.0, true);
        session.record(30.0, true);

        assert_eq!(session.transmitted, 4);
        assert_eq!(session.received, 3);
        assert_eq!(session.loss_pct(), 25.0);
        assert_eq!(session.min_latency, Some(10.0));
        assert_eq!(session.max_latency, 2000.0);
    }

    #[test]
    fn test_session_stddev() {
        let mut session = session();
        for sample in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            session.record(sample, true);
        }
        assert!((session.stddev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let mut session = session();
        for i in 0..(ROLLING_WINDOW + 5) {
            session.record(i as f64, true);
        }

        assert_eq!(session.recent.len(), ROLLING_WINDOW);
        assert_eq!(session.recent.front(), Some(&5.0));
        assert_eq!(session.recent.back(), Some(&34.0));
    }
}
