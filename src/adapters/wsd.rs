//! WS-Discovery probe: SOAP-over-UDP Probe message sent unicast, with
//! namespace-tolerant parsing of the ProbeMatches reply. ONVIF cameras,
//! printers and scanners are told apart by the Types token list.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

use super::util::{collect_responses, send_udp};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

pub const WSD_PORT: u16 = 3702;
const DEBOUNCE: Duration = Duration::from_millis(500);

fn random_uuid() -> String {
    let mut rng = rand::rng();
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes[..]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

/// WS-Discovery Probe for any Types, fresh MessageID per call.
pub fn probe_payload() -> Vec<u8> {
    let message_id = random_uuid();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery">
 <soap:Header>
  <wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>
  <wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>
  <wsa:MessageID>urn:uuid:{message_id}</wsa:MessageID>
 </soap:Header>
 <soap:Body>
  <wsd:Probe/>
 </soap:Body>
</soap:Envelope>"#
    )
    .into_bytes()
}

lazy_static! {
    static ref TYPES_RE: Regex =
        Regex::new(r"(?is)<(?:[A-Za-z0-9_.-]+:)?Types(?:\s[^>]*)?>\s*(.*?)\s*</(?:[A-Za-z0-9_.-]+:)?Types\s*>").unwrap();
    static ref XADDRS_RE: Regex =
        Regex::new(r"(?is)<(?:[A-Za-z0-9_.-]+:)?XAddrs(?:\s[^>]*)?>\s*(.*?)\s*</(?:[A-Za-z0-9_.-]+:)?XAddrs\s*>").unwrap();
    static ref ADDRESS_RE: Regex =
        Regex::new(r"(?is)<(?:[A-Za-z0-9_.-]+:)?Address(?:\s[^>]*)?>\s*(.*?)\s*</(?:[A-Za-z0-9_.-]+:)?Address\s*>").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsdKind {
    Onvif,
    Printer,
    Scanner,
    Other,
}

impl WsdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onvif => "onvif",
            Self::Printer => "printer",
            Self::Scanner => "scanner",
            Self::Other => "other",
        }
    }
}

/// Classify a device by the local parts of its Types tokens.
pub fn classify_types(types: &str) -> WsdKind {
    let locals: Vec<String> = types
        .split_whitespace()
        .map(|token| {
            token
                .rsplit_once(':')
                .map(|(_, local)| local)
                .unwrap_or(token)
                .to_ascii_lowercase()
        })
        .collect();

    if locals.iter().any(|l| l.contains("networkvideotransmitter")) {
        WsdKind::Onvif
    } else if locals.iter().any(|l| l.contains("print")) {
        WsdKind::Printer
    } else if locals.iter().any(|l| l.contains("scan")) {
        WsdKind::Scanner
    } else {
        WsdKind::Other
    }
}

#[derive(Debug, Default)]
pub struct ProbeMatch {
    pub types: Option<String>,
    pub xaddrs: Vec<String>,
    pub endpoint: Option<String>,
}

pub fn parse_probe_match(xml: &str) -> Option<ProbeMatch> {
    if !xml.to_ascii_lowercase().contains("probematch") {
        return None;
    }
    let types = TYPES_RE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty());
    let xaddrs = XADDRS_RE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| {
            m.as_str()
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let endpoint = ADDRESS_RE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    Some(ProbeMatch {
        types,
        xaddrs,
        endpoint,
    })
}

#[derive(Default)]
pub struct WsdAdapter;

#[async_trait]
impl Adapter for WsdAdapter {
    fn name(&self) -> &'static str {
        "wsd"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["wsd", "ws-discovery"]
    }

    fn default_port(&self) -> u16 {
        WSD_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let target = SocketAddr::from((host, port));
        let socket = match send_udp(target, &probe_payload()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::trace!("wsd probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let responses = collect_responses(&socket, host, options.slice(0.8), DEBOUNCE).await;
        if responses.is_empty() {
            return Vec::new();
        }

        let mut kinds = BTreeSet::new();
        let mut types_seen = BTreeSet::new();
        let mut xaddrs = BTreeSet::new();
        let mut endpoint = None;
        for raw in &responses {
            let Some(probe_match) = parse_probe_match(&String::from_utf8_lossy(raw)) else {
                continue;
            };
            if let Some(types) = &probe_match.types {
                kinds.insert(classify_types(types).as_str());
                types_seen.insert(types.clone());
            }
            xaddrs.extend(probe_match.xaddrs);
            if endpoint.is_none() {
                endpoint = probe_match.endpoint;
            }
        }
        if types_seen.is_empty() && endpoint.is_none() {
            return Vec::new();
        }

        if kinds.contains("printer") {
            registry::mark_printer(host, "wsd", serde_json::Map::new());
        }

        let mut metric = Metric::new("wsd")
            .tag("port", &port.to_string())
            .field("responses", responses.len() as i64)
            .field_opt("endpoint", endpoint.as_deref());
        if !kinds.is_empty() {
            metric = metric.field("kinds", kinds.into_iter().collect::<Vec<_>>().join(","));
        }
        if !types_seen.is_empty() {
            metric = metric.field(
                "types",
                types_seen.into_iter().collect::<Vec<_>>().join(" "),
            );
        }
        if !xaddrs.is_empty() {
            metric = metric.field("xaddrs", xaddrs.into_iter().collect::<Vec<_>>().join(","));
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<WsdAdapter>));
