use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::ProbeError;
use crate::state::{
    AggregatorHandle, AggregatorState, HostStatsMap, MessageKind, PathStatsMap, PingHistory,
    PingSession, ProbeResult, Trace,
};

/// One exported record, tagged with its message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Record {
    HopSequence(Trace),
    UnhealthyHost(ProbeResult),
    HostStats(HostStatsMap),
    PathStats(PathStatsMap),
    PingHistory(PingHistory),
}

impl Record {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::HopSequence(_) => MessageKind::HopSequence,
            Self::UnhealthyHost(_) => MessageKind::UnhealthyHost,
            Self::HostStats(_) => MessageKind::HostStats,
            Self::PathStats(_) => MessageKind::PathStats,
            Self::PingHistory(_) => MessageKind::PingHistory,
        }
    }
}

/// Point-in-time dump of everything the aggregator holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    /// Local ping tally, when taken by the binary at exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<PingSession>,
    pub records: Vec<Record>,
}

impl Snapshot {
    fn from_parts(
        history: PingHistory,
        hosts: HostStatsMap,
        paths: PathStatsMap,
        traces: impl IntoIterator<Item = Trace>,
        unhealthy: impl IntoIterator<Item = ProbeResult>,
    ) -> Self {
        let mut records = vec![
            Record::PingHistory(history),
            Record::HostStats(hosts),
            Record::PathStats(paths),
        ];
        records.extend(traces.into_iter().map(Record::HopSequence));
        records.extend(unhealthy.into_iter().map(Record::UnhealthyHost));

        Self {
            generated_at: Utc::now(),
            session: None,
            records,
        }
    }

    /// Snapshot of a stopped aggregator's final state
    pub fn from_state(state: AggregatorState) -> Self {
        Self::from_parts(
            state.history,
            state.hosts,
            state.paths,
            state.traces.into_values(),
            state.unhealthy.into_iter().map(|record| record.hop),
        )
    }

    /// Snapshot of a running aggregator, one request per map
    pub async fn collect(handle: &AggregatorHandle) -> Result<Self, ProbeError> {
        let history = handle.ping_history().await?;
        let hosts = handle.host_stats().await?;
        let paths = handle.path_stats().await?;
        let traces = handle.latest_traces().await?;
        let unhealthy = handle.unhealthy_hosts().await?;

        Ok(Self::from_parts(
            history,
            hosts,
            paths,
            traces.into_values(),
            unhealthy.into_iter().map(|record| record.hop),
        ))
    }

    pub fn with_session(mut self, session: PingSession) -> Self {
        self.session = Some(session);
        self
    }

    /// Records of one kind
    pub fn records_of(&self, kind: MessageKind) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(move |r| r.kind() == kind)
    }
}

/// Export snapshot to JSON format
pub fn export_json<W: Write>(snapshot: &Snapshot, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, snapshot)?;
    Ok(())
}

/// Export snapshot to a file
pub fn export_json_file(snapshot: &Snapshot, path: &std::path::Path) -> Result<()> {
    use anyhow::Context;

    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    export_json(snapshot, &mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::result::tests::hop;
    use crate::state::{HostStats, PathStats};
    use std::net::Ipv4Addr;

    fn state() -> AggregatorState {
        let mut state = AggregatorState::new(10);
        let mut trace = Trace::new(Ipv4Addr::new(8, 8, 8, 8));
        trace.hops.push(Some(hop(1, Ipv4Addr::new(10, 0, 0, 1), 3.0)));
        trace.hops.push(None);
        state.record_trace(trace);
        state.record_unhealthy(hop(4, Ipv4Addr::new(10, 0, 0, 4), 180.0));
        state
            .hosts
            .insert("10.0.0.1".into(), HostStats::new("10.0.0.1".into(), None, 3.0));
        state
            .paths
            .insert("10.0.0.1 > *".into(), PathStats::new("10.0.0.1 > *".into(), 3.0, 3.0));
        state
    }

    #[test]
    fn test_snapshot_tags_every_record() {
        let snapshot = Snapshot::from_state(state());
        let json = serde_json::to_value(&snapshot).unwrap();
        let kinds: Vec<_> = json["records"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["kind"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(
            kinds,
            vec!["ping_history", "host_stats", "path_stats", "hop_sequence", "unhealthy_host"]
        );
        assert!(json.get("session").is_none());
        // Gaps serialize as null
        assert!(json["records"][3]["data"]["hops"][1].is_null());
        assert_eq!(json["records"][4]["data"]["ttl"], 4);
    }

    #[test]
    fn test_export_reads_back() {
        let session = PingSession::new(Ipv4Addr::new(8, 8, 8, 8));
        let snapshot = Snapshot::from_state(state()).with_session(session);

        let mut buf = Vec::new();
        export_json(&snapshot, &mut buf).unwrap();
        let back: Snapshot = serde_json::from_slice(&buf).unwrap();

        assert_eq!(back, snapshot);
        assert_eq!(back.records_of(MessageKind::UnhealthyHost).count(), 1);
    }
}
