use serde::{Deserialize, Serialize};

/// Placeholder minimum for a host whose first sample carried no real latency.
pub const UNSET_MIN_LATENCY_MS: f64 = 9999.0;

/// Latency bucket thresholds, checked highest first
pub const HIGH_LATENCY_700_MS: f64 = 700.0;
pub const HIGH_LATENCY_400_MS: f64 = 400.0;
pub const HIGH_LATENCY_100_MS: f64 = 100.0;

/// Recency-biased running average: each sample carries half the weight.
pub fn blend(avg: f64, sample: f64) -> f64 {
    (avg + sample) / 2.0
}

/// Presentation band for a ping sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyBand {
    /// Under 40 ms
    Low,
    /// 40 to 65 ms, left unclassified
    #[default]
    Unclassified,
    /// 65 to 150 ms
    Elevated,
    /// Over 150 ms
    High,
}

impl LatencyBand {
    pub fn classify(latency_ms: f64) -> Self {
        if latency_ms < 40.0 {
            Self::Low
        } else if latency_ms > 150.0 {
            Self::High
        } else if latency_ms >= 65.0 {
            Self::Elevated
        } else {
            Self::Unclassified
        }
    }
}

/// Running statistics for one target or hop address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub host_name: String,
    /// Reverse DNS name, resolved once when the host is first seen
    pub dns_name: Option<String>,
    pub avg_latency: f64,
    pub max_latency: f64,
    pub min_latency: f64,
    pub trip_count: u64,
    pub high_latency_100: u64,
    pub high_latency_400: u64,
    pub high_latency_700: u64,
}

impl HostStats {
    /// Seed a record from its first sample
    pub fn new(host_name: String, dns_name: Option<String>, latency_ms: f64) -> Self {
        let mut stats = Self {
            host_name,
            dns_name,
            avg_latency: latency_ms,
            max_latency: latency_ms,
            min_latency: if latency_ms == 0.0 {
                UNSET_MIN_LATENCY_MS
            } else {
                latency_ms
            },
            trip_count: 0,
            high_latency_100: 0,
            high_latency_400: 0,
            high_latency_700: 0,
        };
        stats.count_trip(latency_ms);
        stats
    }

    /// Fold a later sample into an existing record
    pub fn record(&mut self, latency_ms: f64) {
        // Zero means no real measurement, same as for a fresh host
        if latency_ms != 0.0 && latency_ms < self.min_latency {
            self.min_latency = latency_ms;
        }
        if latency_ms > self.max_latency {
            self.max_latency = latency_ms;
        }
        self.avg_latency = blend(self.avg_latency, latency_ms);
        self.count_trip(latency_ms);
    }

    fn count_trip(&mut self, latency_ms: f64) {
        self.trip_count += 1;
        if latency_ms > HIGH_LATENCY_700_MS {
            self.high_latency_700 += 1;
        } else if latency_ms > HIGH_LATENCY_400_MS {
            self.high_latency_400 += 1;
        } else if latency_ms > HIGH_LATENCY_100_MS {
            self.high_latency_100 += 1;
        }
    }
}

/// Running statistics for one distinct hop path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub path_name: String,
    pub max_latency_avg: f64,
    pub avg_latency: f64,
    pub trip_count: u64,
}

impl PathStats {
    pub fn new(path_name: String, avg_latency: f64, max_latency: f64) -> Self {
        Self {
            path_name,
            max_latency_avg: max_latency,
            avg_latency,
            trip_count: 1,
        }
    }

    pub fn record(&mut self, avg_latency: f64, max_latency: f64) {
        self.avg_latency = blend(self.avg_latency, avg_latency);
        self.max_latency_avg = blend(self.max_latency_avg, max_latency);
        self.trip_count += 1;
    }
}
