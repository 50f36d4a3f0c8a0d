//! Protocol adapters. Every adapter exposes the same contract:
//! `discover(host, port, options)` returning a sequence of metric records.
//! An empty sequence means "no device of this protocol here" and is not an
//! error; adapters never propagate errors across this boundary.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

pub mod bacnet;
pub mod cip;
pub mod http;
pub mod limits;
pub mod mdns;
pub mod modbus;
pub mod opcua;
pub mod prometheus;
pub mod s7;
pub mod sip;
pub mod snmp;
pub mod ssdp;
pub mod ssh;
pub mod winrm;
pub mod wsd;

pub(crate) mod util;

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: serde_json::Map::new(),
            tags: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field_opt(mut self, key: &str, value: Option<impl Into<serde_json::Value>>) -> Self {
        if let Some(v) = value {
            self.fields.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Per-invocation options. `deadline` is set by the dispatcher 10% before
/// the external timeout so a probe can finish cleanly.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub deadline: Instant,
    pub verbose: bool,
}

impl ProbeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        let inner = timeout.mul_f64(0.9);
        Self {
            timeout,
            deadline: Instant::now() + inner,
            verbose: false,
        }
    }

    /// Budget left before the internal deadline, floored at zero.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// A slice of the remaining budget, useful for multi-step exchanges.
    pub fn slice(&self, fraction: f64) -> Duration {
        self.remaining().mul_f64(fraction.clamp(0.0, 1.0))
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Service labels (from the port-lookup table or scan tools) that route
    /// a discovered port to this adapter.
    fn service_labels(&self) -> &'static [&'static str];

    fn default_port(&self) -> u16;

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric>;
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterFactory(pub fn() -> Box<dyn Adapter>);

impl AdapterFactory {
    pub const fn new(factory: fn() -> Box<dyn Adapter>) -> Self {
        Self(factory)
    }

    pub fn create(&self) -> Box<dyn Adapter> {
        (self.0)()
    }
}

pub fn create_adapter<T>() -> Box<dyn Adapter>
where
    T: Adapter + Default + 'static,
{
    Box::new(T::default())
}

inventory::collect!(AdapterFactory);

pub struct AdapterRegistry;

impl AdapterRegistry {
    pub fn all_adapters() -> Vec<Box<dyn Adapter>> {
        inventory::iter::<AdapterFactory>()
            .map(|factory| factory.create())
            .collect()
    }

    /// Resolve a service label to the adapter registered for it.
    pub fn for_label(label: &str) -> Option<Box<dyn Adapter>> {
        inventory::iter::<AdapterFactory>().find_map(|factory| {
            let adapter = factory.create();
            if adapter.service_labels().contains(&label) {
                Some(adapter)
            } else {
                None
            }
        })
    }

    pub fn find_by_name(name: &str) -> Option<Box<dyn Adapter>> {
        inventory::iter::<AdapterFactory>()
            .map(|factory| factory.create())
            .find(|a| a.name() == name)
    }
}

/// Flatten a metric sequence into the payload stored on the host record:
/// fields and tags from every metric merged into a single object.
pub fn flatten_metrics(metrics: &[Metric]) -> serde_json::Value {
    let mut merged = serde_json::Map::new();
    for metric in metrics {
        for (k, v) in &metric.fields {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &metric.tags {
            merged.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
    }
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_protocols() {
        let adapters = AdapterRegistry::all_adapters();
        let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
        for expected in [
            "ssh", "http", "sip", "winrm", "prometheus", "ssdp", "wsd", "mdns", "snmp",
            "bacnet", "modbus", "s7", "cip", "opcua",
        ] {
            assert!(names.contains(&expected), "adapter {expected} not registered");
        }
        // No duplicate names
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn labels_resolve_to_adapters() {
        assert_eq!(AdapterRegistry::for_label("ssh").unwrap().name(), "ssh");
        assert_eq!(AdapterRegistry::for_label("https").unwrap().name(), "http");
        assert_eq!(AdapterRegistry::for_label("enip").unwrap().name(), "cip");
        assert!(AdapterRegistry::for_label("no-such-service").is_none());
    }

    #[test]
    fn flatten_merges_fields_and_tags() {
        let metrics = vec![
            Metric::new("a").field("vendor", "Acme").tag("port", "102"),
            Metric::new("b").field("model", "S7-1200"),
        ];
        let flat = flatten_metrics(&metrics);
        assert_eq!(flat["vendor"], "Acme");
        assert_eq!(flat["model"], "S7-1200");
        assert_eq!(flat["port"], "102");
    }

    #[test]
    fn options_deadline_has_margin() {
        let options = ProbeOptions::with_timeout(Duration::from_secs(10));
        let remaining = options.remaining();
        assert!(remaining <= Duration::from_secs(9));
        assert!(remaining > Duration::from_secs(8));
    }
}
