//! mDNS service enumeration: PTR questions for the common service names
//! sent straight at the target, answers merged into service instances, and
//! cast-device HTTP endpoints probed in parallel for fields the mDNS layer
//! does not carry.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::util::collect_responses;
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

pub mod cast;
pub mod dns;

use dns::{RecordData, build_ptr_query, parse_message};

pub const MDNS_PORT: u16 = 5353;
const QUERY_STAGGER: Duration = Duration::from_millis(100);
const DEBOUNCE: Duration = Duration::from_millis(500);

const SERVICE_NAMES: &[&str] = &[
    "_googlecast._tcp.local",
    "_airplay._tcp.local",
    "_raop._tcp.local",
    "_ipp._tcp.local",
    "_ipps._tcp.local",
    "_printer._tcp.local",
    "_pdl-datastream._tcp.local",
    "_http._tcp.local",
    "_smb._tcp.local",
    "_workstation._tcp.local",
    "_hap._tcp.local",
    "_spotify-connect._tcp.local",
];

const PRINTER_SERVICES: &[&str] = &[
    "_ipp._tcp.local",
    "_ipps._tcp.local",
    "_printer._tcp.local",
    "_pdl-datastream._tcp.local",
];

const CHROMECAST_TXT_KEYS: &[&str] = &["id", "md", "fn", "rs", "bs", "ca", "ve"];
const AIRPLAY_TXT_KEYS: &[&str] = &[
    "deviceid", "model", "features", "srcvers", "osvers", "acl", "flags",
];

#[derive(Debug, Default, Clone)]
pub struct ServiceInstance {
    pub service: String,
    pub port: Option<u16>,
    pub target: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub txt: BTreeMap<String, String>,
}

/// Merge every record from every response into per-instance entries.
pub fn merge_records(messages: &[dns::DnsMessage]) -> BTreeMap<String, ServiceInstance> {
    let mut instances: BTreeMap<String, ServiceInstance> = BTreeMap::new();
    let mut addresses: BTreeMap<String, Ipv4Addr> = BTreeMap::new();

    for message in messages {
        for record in &message.records {
            match &record.data {
                RecordData::Ptr(instance_name) => {
                    let entry = instances.entry(instance_name.clone()).or_default();
                    if entry.service.is_empty() {
                        entry.service = record.name.clone();
                    }
                }
                RecordData::Srv { port, target, .. } => {
                    let entry = instances.entry(record.name.clone()).or_default();
                    entry.port = Some(*port);
                    entry.target = Some(target.clone());
                }
                RecordData::Txt(entries) => {
                    let entry = instances.entry(record.name.clone()).or_default();
                    for kv in entries {
                        match kv.split_once('=') {
                            Some((k, v)) => {
                                entry.txt.insert(k.to_string(), v.to_string());
                            }
                            None => {
                                entry.txt.insert(kv.clone(), String::new());
                            }
                        }
                    }
                }
                RecordData::A(addr) => {
                    addresses.insert(record.name.clone(), *addr);
                }
                RecordData::Other(_) => {}
            }
        }
    }

    // Backfill service names from the instance label and addresses from the
    // SRV targets.
    for (name, instance) in instances.iter_mut() {
        if instance.service.is_empty() {
            if let Some((_, service)) = name.split_once('.') {
                instance.service = service.to_string();
            }
        }
        if let Some(target) = &instance.target {
            instance.address = addresses.get(target).copied();
        }
    }

    instances
}

fn txt_fields(
    instance: &ServiceInstance,
    keys: &[&str],
    prefix: &str,
    metric: Metric,
) -> Metric {
    let mut metric = metric;
    for key in keys {
        if let Some(value) = instance.txt.get(*key) {
            if !value.is_empty() {
                metric = metric.field(&format!("{prefix}{key}"), value.as_str());
            }
        }
    }
    metric
}

async fn query_services(
    host: Ipv4Addr,
    port: u16,
    options: &ProbeOptions,
) -> anyhow::Result<Vec<dns::DnsMessage>> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    let target = SocketAddr::from((host, port));
    let ids: Vec<u16> = SERVICE_NAMES
        .chunks(8)
        .map(|_| rand::rng().random())
        .collect();

    // One packet per batch of eight questions, staggered.
    for (i, (chunk, id)) in SERVICE_NAMES.chunks(8).zip(ids).enumerate() {
        if i > 0 {
            tokio::time::sleep(QUERY_STAGGER).await;
        }
        let packet = build_ptr_query(id, chunk);
        socket.send_to(&packet, target).await?;
    }

    let raw = collect_responses(&socket, host, options.slice(0.6), DEBOUNCE).await;
    Ok(raw
        .iter()
        .filter_map(|datagram| parse_message(datagram).ok())
        .filter(|m| m.is_response)
        .collect())
}

#[derive(Default)]
pub struct MdnsAdapter;

#[async_trait]
impl Adapter for MdnsAdapter {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["mdns"]
    }

    fn default_port(&self) -> u16 {
        MDNS_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let messages = match query_services(host, port, options).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::trace!("mdns probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let instances = merge_records(&messages);
        let has_cast_service = instances
            .values()
            .any(|i| i.service.contains("_googlecast") || i.service.contains("_airplay"));

        // Cast endpoints carry fields mDNS does not; probe them in parallel.
        let enrich_budget = options.remaining().max(Duration::from_millis(200));
        let (chromecast, airplay) = if has_cast_service || instances.is_empty() {
            tokio::join!(
                cast::chromecast_info(host, enrich_budget),
                cast::airplay_info(host, enrich_budget),
            )
        } else {
            (None, None)
        };

        if instances.is_empty() && chromecast.is_none() && airplay.is_none() {
            return Vec::new();
        }

        let printer_instance = instances
            .values()
            .find(|i| PRINTER_SERVICES.iter().any(|p| i.service.contains(p)));
        if let Some(instance) = printer_instance {
            let mut details = serde_json::Map::new();
            if let Some(ty) = instance.txt.get("ty") {
                details.insert("model".into(), serde_json::Value::String(ty.clone()));
            }
            registry::mark_printer(host, "mdns", details);
        }

        let mut metric = Metric::new("mdns")
            .tag("port", &port.to_string())
            .field("instances", instances.len() as i64);

        let services: std::collections::BTreeSet<&str> = instances
            .values()
            .map(|i| i.service.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        if !services.is_empty() {
            metric = metric.field(
                "services",
                services.into_iter().collect::<Vec<_>>().join(","),
            );
        }

        if let Some(instance) = instances.values().next() {
            metric = metric
                .field_opt("first_instance_target", instance.target.as_deref())
                .field_opt("first_instance_port", instance.port.map(|p| p as i64));
        }
        for instance in instances.values() {
            if instance.service.contains("_googlecast") {
                metric = txt_fields(instance, CHROMECAST_TXT_KEYS, "cast_txt_", metric);
                break;
            }
        }
        for instance in instances.values() {
            if instance.service.contains("_airplay") || instance.service.contains("_raop") {
                metric = txt_fields(instance, AIRPLAY_TXT_KEYS, "airplay_txt_", metric);
                break;
            }
        }

        for enrichment in [chromecast, airplay].into_iter().flatten() {
            if let serde_json::Value::Object(map) = enrichment {
                for (k, v) in map {
                    metric.fields.insert(k, v);
                }
            }
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<MdnsAdapter>));
