//! Process-wide device registry: advisory cross-protocol classification
//! consulted by adapters for gating decisions. Missing entries mean
//! "unknown", never "negative". Created at pipeline start, cleared at exit.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceEntry {
    pub is_printer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_by: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryStats {
    pub entries: usize,
    pub printers: usize,
}

lazy_static! {
    static ref DEVICES: RwLock<HashMap<Ipv4Addr, DeviceEntry>> = RwLock::new(HashMap::new());
}

fn with_entry<F>(ip: Ipv4Addr, f: F)
where
    F: FnOnce(&mut DeviceEntry),
{
    let mut devices = DEVICES.write().expect("device registry poisoned");
    let entry = devices.entry(ip).or_default();
    f(entry);
    entry.last_updated = Some(Utc::now());
}

/// Merge free-form metadata into the entry for `ip`, creating it lazily.
pub fn register(ip: Ipv4Addr, details: serde_json::Map<String, serde_json::Value>) {
    with_entry(ip, |entry| {
        for (k, v) in details {
            entry.details.insert(k, v);
        }
    });
}

/// Record a printer classification. Once set it holds for the rest of the
/// run; later sources only add detail.
pub fn mark_printer(ip: Ipv4Addr, source: &str, details: serde_json::Map<String, serde_json::Value>) {
    tracing::debug!("{} classified as printer by {}", ip, source);
    with_entry(ip, |entry| {
        entry.is_printer = true;
        if entry.detected_by.is_none() {
            entry.detected_by = Some(source.to_string());
        }
        for (k, v) in details {
            entry.details.insert(k, v);
        }
    });
}

pub fn is_printer(ip: Ipv4Addr) -> bool {
    DEVICES
        .read()
        .expect("device registry poisoned")
        .get(&ip)
        .map(|e| e.is_printer)
        .unwrap_or(false)
}

/// Gate for the HTTP and Prometheus adapters: speaking HTTP to a raw-print
/// port queues junk on the printer, so 9100 is skipped on classified hosts.
pub fn should_skip_port_9100(ip: Ipv4Addr) -> bool {
    is_printer(ip)
}

pub fn get(ip: Ipv4Addr) -> Option<DeviceEntry> {
    DEVICES
        .read()
        .expect("device registry poisoned")
        .get(&ip)
        .cloned()
}

pub fn clear() {
    DEVICES.write().expect("device registry poisoned").clear();
}

pub fn stats() -> RegistryStats {
    let devices = DEVICES.read().expect("device registry poisoned");
    RegistryStats {
        entries: devices.len(),
        printers: devices.values().filter(|e| e.is_printer).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn details(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    #[serial]
    fn missing_entry_means_unknown() {
        clear();
        let ip = Ipv4Addr::new(10, 9, 9, 9);
        assert!(!is_printer(ip));
        assert!(!should_skip_port_9100(ip));
        assert!(get(ip).is_none());
    }

    #[test]
    #[serial]
    fn printer_classification_is_monotonic() {
        clear();
        let ip = Ipv4Addr::new(10, 9, 9, 1);
        mark_printer(ip, "mdns", details(&[("model", "LaserJet")]));
        assert!(is_printer(ip));
        assert_eq!(get(ip).unwrap().detected_by.as_deref(), Some("mdns"));

        // A later merge-only write keeps the classification and the source.
        register(ip, details(&[("serial", "X1")]));
        mark_printer(ip, "snmp", details(&[]));
        let entry = get(ip).unwrap();
        assert!(entry.is_printer);
        assert_eq!(entry.detected_by.as_deref(), Some("mdns"));
        assert_eq!(entry.details["model"], "LaserJet");
        assert_eq!(entry.details["serial"], "X1");
    }

    #[test]
    #[serial]
    fn writes_refresh_last_updated() {
        clear();
        let ip = Ipv4Addr::new(10, 9, 9, 2);
        register(ip, details(&[("a", "1")]));
        let first = get(ip).unwrap().last_updated.unwrap();
        register(ip, details(&[("b", "2")]));
        let second = get(ip).unwrap().last_updated.unwrap();
        assert!(second >= first);
    }

    #[test]
    #[serial]
    fn stats_counts_printers() {
        clear();
        mark_printer(Ipv4Addr::new(10, 9, 9, 3), "snmp", details(&[]));
        register(Ipv4Addr::new(10, 9, 9, 4), details(&[("seen", "yes")]));
        let stats = stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.printers, 1);
        clear();
        assert_eq!(super::stats().entries, 0);
    }
}
