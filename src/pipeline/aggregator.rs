//! Shared host-record store mutated by the parallel sweeps and the
//! traverser. Individual `(ip, port)` insertions are atomic behind the lock;
//! the state after a stage drains is the set union of everything the
//! stage's sub-tasks reported.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PingStatus {
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PortTable {
    pub tcp: BTreeMap<u16, Option<String>>,
    pub udp: BTreeMap<u16, Option<String>>,
}

impl PortTable {
    pub fn table(&self, transport: Transport) -> &BTreeMap<u16, Option<String>> {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    pub fn table_mut(&mut self, transport: Transport) -> &mut BTreeMap<u16, Option<String>> {
        match transport {
            Transport::Tcp => &mut self.tcp,
            Transport::Udp => &mut self.udp,
        }
    }

    /// Label of a port if it is present and labelled.
    pub fn label(&self, transport: Transport, port: u16) -> Option<&str> {
        self.table(transport)
            .get(&port)
            .and_then(|l| l.as_deref())
    }

    pub fn has(&self, transport: Transport, port: u16) -> bool {
        self.table(transport).contains_key(&port)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostRecord {
    pub ping: PingStatus,
    pub ports: PortTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub adapters: BTreeMap<String, serde_json::Value>,
}

/// Keyed by address, so iteration (and therefore serialization) is in
/// ascending numeric IPv4 order.
pub type HostMap = BTreeMap<Ipv4Addr, HostRecord>;

/// Performance window of one sweep stage. Counters are written once, when
/// the stage finishes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageWindow {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration")]
    pub duration_s: f64,
    pub hosts_found: usize,
    pub ports_found: usize,
    pub hosts_with_ports: usize,
    pub rate: f64,
}

impl StageWindow {
    pub fn begin(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, hosts_found: usize, ports_found: usize, hosts_with_ports: usize) {
        let finished = Utc::now();
        self.finished_at = Some(finished);
        self.hosts_found = hosts_found;
        self.ports_found = ports_found;
        self.hosts_with_ports = hosts_with_ports;
        if let Some(started) = self.started_at {
            let secs = (finished - started).num_milliseconds() as f64 / 1000.0;
            self.duration_s = secs;
            if secs > 0.0 {
                let events = hosts_found.max(ports_found);
                self.rate = events as f64 / secs;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Performance {
    pub ping: StageWindow,
    pub tcp: StageWindow,
    pub udp: StageWindow,
}

#[derive(Clone, Default)]
pub struct Aggregator {
    hosts: Arc<RwLock<HostMap>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ICMP result. A negative result still creates the entry when
    /// one already exists from a port sweep; it never removes anything.
    pub async fn mark_ping(&self, ip: Ipv4Addr, alive: bool, latency_ms: Option<f64>) {
        let mut hosts = self.hosts.write().await;
        let record = hosts.entry(ip).or_default();
        record.ping.alive = alive;
        if alive {
            record.ping.latency_ms = latency_ms;
        }
    }

    /// Record an open port. Ports outside 1-65535 are dropped; labels are
    /// stored as given (the fallback chain runs at the sweep layer).
    pub async fn add_port(
        &self,
        ip: Ipv4Addr,
        transport: Transport,
        port: u16,
        label: Option<String>,
    ) {
        if port == 0 {
            tracing::warn!("dropping port 0 reported for {}", ip);
            return;
        }
        let label = label.filter(|l| !l.is_empty());
        let mut hosts = self.hosts.write().await;
        let record = hosts.entry(ip).or_default();
        record
            .ports
            .table_mut(transport)
            .entry(port)
            .or_insert(label);
    }

    pub async fn set_hostname(&self, ip: Ipv4Addr, hostname: String) {
        let mut hosts = self.hosts.write().await;
        if let Some(record) = hosts.get_mut(&ip) {
            record.hostname = Some(hostname);
        }
    }

    pub async fn set_adapter_payload(
        &self,
        ip: Ipv4Addr,
        adapter: &str,
        payload: serde_json::Value,
    ) {
        let mut hosts = self.hosts.write().await;
        if let Some(record) = hosts.get_mut(&ip) {
            record.adapters.insert(adapter.to_string(), payload);
        }
    }

    /// Run a closure against the full map under the write lock. Used by the
    /// post-processor, which is a pure map-to-map function.
    pub async fn with_map<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HostMap) -> R,
    {
        let mut hosts = self.hosts.write().await;
        f(&mut hosts)
    }

    pub async fn snapshot(&self) -> HostMap {
        self.hosts.read().await.clone()
    }

    pub async fn host_count(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn into_map(self) -> HostMap {
        self.hosts.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parallel_writers_union() {
        let agg = Aggregator::new();
        let mut tasks = Vec::new();
        for octet in 1..=20u8 {
            let agg = agg.clone();
            tasks.push(tokio::spawn(async move {
                let ip = Ipv4Addr::new(10, 0, 0, octet);
                agg.add_port(ip, Transport::Tcp, 22, Some("ssh".into())).await;
                agg.add_port(ip, Transport::Udp, 161, Some("snmp".into())).await;
                agg.mark_ping(ip, true, Some(1.0)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let map = agg.snapshot().await;
        assert_eq!(map.len(), 20);
        for record in map.values() {
            assert_eq!(record.ports.tcp.get(&22), Some(&Some("ssh".to_string())));
            assert_eq!(record.ports.udp.get(&161), Some(&Some("snmp".to_string())));
            assert!(record.ping.alive);
        }
    }

    #[tokio::test]
    async fn first_label_wins_for_duplicate_port() {
        let agg = Aggregator::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        agg.add_port(ip, Transport::Tcp, 80, Some("http".into())).await;
        agg.add_port(ip, Transport::Tcp, 80, Some("http-alt".into())).await;
        let map = agg.snapshot().await;
        assert_eq!(map[&ip].ports.tcp[&80], Some("http".to_string()));
    }

    #[tokio::test]
    async fn port_zero_is_rejected() {
        let agg = Aggregator::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        agg.add_port(ip, Transport::Tcp, 0, None).await;
        assert_eq!(agg.host_count().await, 0);
    }

    #[tokio::test]
    async fn map_iterates_in_numeric_order() {
        let agg = Aggregator::new();
        for octet in [200u8, 3, 120, 1] {
            agg.mark_ping(Ipv4Addr::new(192, 168, 1, octet), true, None).await;
        }
        // 10.0.0.x sorts below 192.168.1.x numerically
        agg.mark_ping(Ipv4Addr::new(10, 0, 0, 9), true, None).await;

        let keys: Vec<Ipv4Addr> = agg.snapshot().await.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort_by_key(|ip| u32::from(*ip));
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn dead_host_with_ports_is_kept() {
        let agg = Aggregator::new();
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        agg.add_port(ip, Transport::Tcp, 443, Some("https".into())).await;
        agg.mark_ping(ip, false, None).await;
        let map = agg.snapshot().await;
        assert!(!map[&ip].ping.alive);
        assert!(map[&ip].ping.latency_ms.is_none());
        assert!(map[&ip].ports.has(Transport::Tcp, 443));
    }
}
