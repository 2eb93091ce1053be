//! Latency-jump detection over a completed trace.
//!
//! A hop is suspicious when its latency jumps past the previous hop by more
//! than the threshold and sets a new high for the trace. A slow predecessor of
//! a flagged hop is reported with it. When the trace as a whole peaks above
//! the threshold, a few confirmation traces are run to sample the path again.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use crate::error::ProbeError;
use crate::state::ProbeResult;

/// Latency jump (and absolute level) that marks a hop as suspicious
pub const ANOMALY_THRESHOLD_MS: f64 = 100.0;
/// Confirmation traces run after a spike
pub const CONFIRMATION_TRACES: usize = 4;
/// Pause between confirmation traces
pub const CONFIRMATION_SPACING: Duration = Duration::from_millis(200);

/// Outcome of scanning one hop sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyScan {
    /// Flagged hops in TTL order, each reported once
    pub flagged: Vec<ProbeResult>,
    /// Highest latency among hops that had a baseline to compare against
    pub high_water_mark: f64,
}

impl AnomalyScan {
    /// Did the trace peak high enough to warrant confirmation traces?
    pub fn needs_confirmation(&self, threshold_ms: f64) -> bool {
        self.high_water_mark > threshold_ms
    }
}

/// Walk `hops` in TTL order and flag abnormal latency jumps.
///
/// A zero previous latency (first hop, or after a silent hop) has no baseline
/// to compare against; that hop only becomes the next baseline and does not
/// raise the high-water mark.
pub fn scan_hops(hops: &[Option<ProbeResult>], threshold_ms: f64) -> AnomalyScan {
    let latency = |i: usize| hops[i].as_ref().map_or(0.0, |h| h.latency_ms);

    let mut flagged = BTreeSet::new();
    let mut last_latency = 0.0;
    let mut high_water_mark: f64 = 0.0;

    for i in 0..hops.len() {
        let current = latency(i);

        if last_latency == 0.0 {
            last_latency = current;
            continue;
        }

        if (current - last_latency).abs() > threshold_ms
            && current != 0.0
            && current > high_water_mark
        {
            if i > 0 && latency(i - 1) > threshold_ms {
                flagged.insert(i - 1);
            }
            flagged.insert(i);
        }

        last_latency = current;
        high_water_mark = high_water_mark.max(current);
    }

    AnomalyScan {
        flagged: flagged
            .into_iter()
            .filter_map(|i| hops[i].clone())
            .collect(),
        high_water_mark,
    }
}

/// Run up to `count` confirmation traces, `spacing` apart, keeping the ones
/// that complete. Failed attempts are logged and skipped.
pub async fn confirm<T, F, Fut>(count: usize, spacing: Duration, mut run: F) -> Vec<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let mut confirmations = Vec::with_capacity(count);
    for attempt in 0..count {
        match run().await {
            Ok(trace) => confirmations.push(trace),
            Err(e) => tracing::warn!(attempt, error = %e, "confirmation trace failed"),
        }
        if attempt + 1 < count {
            tokio::time::sleep(spacing).await;
        }
    }
    confirmations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::result::tests::hop;
    use std::net::Ipv4Addr;

    fn hops(latencies: &[f64]) -> Vec<Option<ProbeResult>> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &latency)| {
                let ttl = i as u8 + 1;
                (latency != 0.0).then(|| hop(ttl, Ipv4Addr::new(10, 0, 0, ttl), latency))
            })
            .collect()
    }

    fn flagged_ttls(scan: &AnomalyScan) -> Vec<u8> {
        scan.flagged.iter().map(|h| h.ttl).collect()
    }

    #[test]
    fn test_single_spike_flags_only_that_hop() {
        let scan = scan_hops(&hops(&[20.0, 25.0, 30.0, 180.0, 35.0]), ANOMALY_THRESHOLD_MS);

        assert_eq!(flagged_ttls(&scan), vec![4]);
        assert_eq!(scan.high_water_mark, 180.0);
        assert!(scan.needs_confirmation(ANOMALY_THRESHOLD_MS));
    }

    #[test]
    fn test_slow_predecessor_is_flagged_too() {
        let scan = scan_hops(&hops(&[20.0, 150.0, 300.0]), ANOMALY_THRESHOLD_MS);

        // Hop 2 jumps from 20, hop 3 jumps from 150 and drags hop 2 along once
        assert_eq!(flagged_ttls(&scan), vec![2, 3]);
    }

    #[test]
    fn test_drop_after_spike_is_not_flagged() {
        let scan = scan_hops(&hops(&[10.0, 400.0, 20.0, 30.0]), ANOMALY_THRESHOLD_MS);
        assert_eq!(flagged_ttls(&scan), vec![2]);
    }

    #[test]
    fn test_gap_resets_baseline() {
        let scan = scan_hops(&hops(&[10.0, 0.0, 250.0, 240.0]), ANOMALY_THRESHOLD_MS);

        // Hop 3 is only a baseline; the mark comes from hop 4
        assert!(scan.flagged.is_empty());
        assert_eq!(scan.high_water_mark, 240.0);
        assert!(scan.needs_confirmation(ANOMALY_THRESHOLD_MS));
    }

    #[test]
    fn test_slow_first_hop_is_flagged_on_drop() {
        let scan = scan_hops(&hops(&[300.0, 150.0]), ANOMALY_THRESHOLD_MS);

        assert_eq!(flagged_ttls(&scan), vec![1, 2]);
        assert_eq!(scan.high_water_mark, 150.0);
    }

    #[test]
    fn test_slow_hop_after_gap_is_flagged_on_drop() {
        let scan = scan_hops(&hops(&[20.0, 0.0, 400.0, 250.0]), ANOMALY_THRESHOLD_MS);

        assert_eq!(flagged_ttls(&scan), vec![3, 4]);
        assert_eq!(scan.high_water_mark, 250.0);
    }

    #[test]
    fn test_lone_baseline_does_not_need_confirmation() {
        let scan = scan_hops(&hops(&[500.0]), ANOMALY_THRESHOLD_MS);

        assert!(scan.flagged.is_empty());
        assert_eq!(scan.high_water_mark, 0.0);
        assert!(!scan.needs_confirmation(ANOMALY_THRESHOLD_MS));
    }

    #[test]
    fn test_quiet_trace() {
        let scan = scan_hops(&hops(&[1.0, 5.0, 12.0, 14.0]), ANOMALY_THRESHOLD_MS);

        assert!(scan.flagged.is_empty());
        assert!(!scan.needs_confirmation(ANOMALY_THRESHOLD_MS));
        assert_eq!(scan_hops(&[], ANOMALY_THRESHOLD_MS), AnomalyScan::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_runs_spaced_attempts() {
        let start = tokio::time::Instant::now();
        let mut attempts = 0;

        let results = confirm(CONFIRMATION_TRACES, CONFIRMATION_SPACING, || {
            attempts += 1;
            let n = attempts;
            async move {
                if n == 2 {
                    Err(ProbeError::Parse("bad".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(results, vec![1, 3, 4]);
        assert_eq!(start.elapsed(), CONFIRMATION_SPACING * 3);
    }
}
