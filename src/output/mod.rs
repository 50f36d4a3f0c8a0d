//! Final document assembly. Host keys serialize in ascending numeric IPv4
//! order and ports in ascending numeric order because the underlying maps
//! are ordered; nothing here re-sorts.

use serde::Serialize;

use crate::pipeline::aggregator::{HostMap, Performance};
use crate::pipeline::traverser::TraverserReport;
use crate::scan::range::ScanRange;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_hosts: usize,
    pub alive_hosts: usize,
    pub hosts_with_tcp_ports: usize,
    pub hosts_with_udp_ports: usize,
    pub total_tcp_ports: usize,
    pub total_udp_ports: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub subnet: String,
    pub duration: String,
    pub summary: Summary,
    pub latency: Option<LatencySummary>,
    pub performance: Performance,
    pub hosts: HostMap,
    pub traverser: TraverserReport,
}

fn summarize(hosts: &HostMap) -> Summary {
    Summary {
        total_hosts: hosts.len(),
        alive_hosts: hosts.values().filter(|h| h.ping.alive).count(),
        hosts_with_tcp_ports: hosts.values().filter(|h| !h.ports.tcp.is_empty()).count(),
        hosts_with_udp_ports: hosts.values().filter(|h| !h.ports.udp.is_empty()).count(),
        total_tcp_ports: hosts.values().map(|h| h.ports.tcp.len()).sum(),
        total_udp_ports: hosts.values().map(|h| h.ports.udp.len()).sum(),
    }
}

fn latency_summary(hosts: &HostMap) -> Option<LatencySummary> {
    let samples: Vec<f64> = hosts
        .values()
        .filter_map(|h| h.ping.latency_ms)
        .collect();
    if samples.is_empty() {
        return None;
    }
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    Some(LatencySummary { min, max, avg })
}

pub fn build_report(
    range: &ScanRange,
    duration_s: f64,
    performance: Performance,
    hosts: HostMap,
    traverser: TraverserReport,
) -> ScanReport {
    ScanReport {
        subnet: range.to_string(),
        duration: format!("{duration_s:.2}"),
        summary: summarize(&hosts),
        latency: latency_summary(&hosts),
        performance,
        hosts,
        traverser,
    }
}

/// Pretty-print with 2-space indentation; this is the process's stdout.
pub fn render(report: &ScanReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
