//! SSDP/UPnP discovery: unicast M-SEARCH, debounced response collection,
//! then a fetch of each advertised device description. Description URLs
//! that carry hostnames are rewritten to the target address so no DNS
//! resolution happens mid-probe.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use super::util::{collect_responses, send_udp};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

pub const SSDP_PORT: u16 = 1900;
const DEBOUNCE: Duration = Duration::from_millis(500);
const DESCRIPTION_CAP: usize = 64 * 1024;

/// M-SEARCH formatted for the multicast group, sent unicast to the target.
pub fn msearch_payload() -> Vec<u8> {
    b"M-SEARCH * HTTP/1.1\r\n\
      HOST: 239.255.255.250:1900\r\n\
      MAN: \"ssdp:discover\"\r\n\
      MX: 2\r\n\
      ST: ssdp:all\r\n\
      USER-AGENT: hostscout/0.3 UPnP/1.1\r\n\r\n"
        .to_vec()
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SsdpResponse {
    pub location: Option<String>,
    pub server: Option<String>,
    pub st: Option<String>,
    pub usn: Option<String>,
}

pub fn parse_response(raw: &str) -> Option<SsdpResponse> {
    let mut lines = raw.lines();
    let status = lines.next()?;
    if !status.contains("200") || !status.to_ascii_uppercase().contains("HTTP") {
        return None;
    }

    let mut response = SsdpResponse::default();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_uppercase().as_str() {
            "LOCATION" => response.location = Some(value),
            "SERVER" => response.server = Some(value),
            "ST" => response.st = Some(value),
            "USN" => response.usn = Some(value),
            _ => {}
        }
    }
    Some(response)
}

/// Rewrite the host component of a description URL to the probed address.
pub fn rewrite_location(location: &str, target: Ipv4Addr) -> Option<String> {
    let mut url = Url::parse(location).ok()?;
    url.set_host(Some(&target.to_string())).ok()?;
    Some(url.to_string())
}

lazy_static! {
    static ref FRIENDLY_NAME_RE: Regex = leaf_re("friendlyName");
    static ref MANUFACTURER_RE: Regex = leaf_re("manufacturer");
    static ref MODEL_NAME_RE: Regex = leaf_re("modelName");
    static ref MODEL_NUMBER_RE: Regex = leaf_re("modelNumber");
    static ref DEVICE_TYPE_RE: Regex = leaf_re("deviceType");
    static ref UDN_RE: Regex = leaf_re("UDN");
    static ref SERVICE_TYPE_RE: Regex = leaf_re("serviceType");
}

fn leaf_re(tag: &str) -> Regex {
    // Tolerates namespace prefixes and attributes on either side.
    Regex::new(&format!(
        r"(?is)<(?:[A-Za-z0-9_.-]+:)?{tag}(?:\s[^>]*)?>\s*(.*?)\s*</(?:[A-Za-z0-9_.-]+:)?{tag}\s*>"
    ))
    .unwrap()
}

fn leaf(block: &str, re: &Regex) -> Option<String> {
    re.captures(block)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Default, Clone)]
pub struct UpnpDevice {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub udn: Option<String>,
    pub services: Vec<String>,
}

/// Split a description document into `<device>` blocks, nested ones
/// included, by tracking open/close depth.
fn device_blocks(xml: &str) -> Vec<&str> {
    let lower = xml.to_ascii_lowercase();
    let mut blocks = Vec::new();
    let mut opens: Vec<usize> = Vec::new();
    let mut cursor = 0;

    while cursor < lower.len() {
        let open = lower[cursor..].find("<device>");
        let close = lower[cursor..].find("</device>");
        match (open, close) {
            (Some(o), Some(c)) if o < c => {
                opens.push(cursor + o);
                cursor += o + "<device>".len();
            }
            (_, Some(c)) => {
                if let Some(start) = opens.pop() {
                    blocks.push(&xml[start..cursor + c + "</device>".len()]);
                }
                cursor += c + "</device>".len();
            }
            (Some(o), None) => {
                opens.push(cursor + o);
                cursor += o + "<device>".len();
            }
            (None, None) => break,
        }
    }

    blocks
}

/// Enumerate every device in a description document, root and embedded.
pub fn parse_description(xml: &str) -> Vec<UpnpDevice> {
    device_blocks(xml)
        .into_iter()
        .map(|block| {
            // Strip nested device blocks so leaf fields stay local.
            let own: String = match block[1..].to_ascii_lowercase().find("<device>") {
                Some(inner) => block[..inner + 1].to_string(),
                None => block.to_string(),
            };
            UpnpDevice {
                device_type: leaf(&own, &DEVICE_TYPE_RE),
                friendly_name: leaf(&own, &FRIENDLY_NAME_RE),
                manufacturer: leaf(&own, &MANUFACTURER_RE),
                model_name: leaf(&own, &MODEL_NAME_RE),
                model_number: leaf(&own, &MODEL_NUMBER_RE),
                udn: leaf(&own, &UDN_RE),
                services: SERVICE_TYPE_RE
                    .captures_iter(block)
                    .filter_map(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
            }
        })
        .collect()
}

async fn fetch_description(url: &str, budget: Duration) -> Result<String> {
    let client = reqwest::Client::builder().timeout(budget).build()?;
    let mut response = client.get(url).send().await?;
    let mut collected: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = DESCRIPTION_CAP.saturating_sub(collected.len());
        if room == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(String::from_utf8_lossy(&collected).to_string())
}

#[derive(Default)]
pub struct SsdpAdapter;

#[async_trait]
impl Adapter for SsdpAdapter {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["ssdp", "upnp"]
    }

    fn default_port(&self) -> u16 {
        SSDP_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let target = SocketAddr::from((host, port));
        let socket = match send_udp(target, &msearch_payload()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::trace!("ssdp probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let raw_responses =
            collect_responses(&socket, host, options.slice(0.6), DEBOUNCE).await;
        if raw_responses.is_empty() {
            return Vec::new();
        }

        let mut server = None;
        let mut sts = BTreeSet::new();
        let mut usns = BTreeSet::new();
        let mut locations = BTreeSet::new();
        for raw in &raw_responses {
            let Some(response) = parse_response(&String::from_utf8_lossy(raw)) else {
                continue;
            };
            if server.is_none() {
                server = response.server;
            }
            if let Some(st) = response.st {
                sts.insert(st);
            }
            if let Some(usn) = response.usn {
                usns.insert(usn);
            }
            if let Some(location) = response.location {
                locations.insert(location);
            }
        }

        let mut devices = Vec::new();
        for location in &locations {
            let Some(fetch_url) = rewrite_location(location, host) else {
                continue;
            };
            match fetch_description(&fetch_url, options.slice(0.5).max(Duration::from_millis(200)))
                .await
            {
                Ok(xml) => devices.extend(parse_description(&xml)),
                Err(e) => tracing::trace!("ssdp description fetch {} - {}", fetch_url, e),
            }
        }

        if devices
            .iter()
            .any(|d| d.device_type.as_deref().is_some_and(|t| t.contains("Printer")))
        {
            registry::mark_printer(host, "ssdp", serde_json::Map::new());
        }

        let root = devices.last().cloned().unwrap_or_default();
        let services: BTreeSet<String> = devices.iter().flat_map(|d| d.services.clone()).collect();

        let mut metric = Metric::new("ssdp")
            .tag("port", &port.to_string())
            .field("responses", raw_responses.len() as i64)
            .field("locations", locations.iter().cloned().collect::<Vec<_>>().join(","))
            .field_opt("server", server.as_deref())
            .field_opt("friendly_name", root.friendly_name.as_deref())
            .field_opt("manufacturer", root.manufacturer.as_deref())
            .field_opt("model_name", root.model_name.as_deref())
            .field_opt("model_number", root.model_number.as_deref())
            .field_opt("device_type", root.device_type.as_deref())
            .field_opt("udn", root.udn.as_deref())
            .field("device_count", devices.len() as i64);

        if !services.is_empty() {
            metric = metric.field(
                "services",
                services.into_iter().collect::<Vec<_>>().join(","),
            );
        }
        if !sts.is_empty() {
            metric = metric.field("search_targets", sts.into_iter().collect::<Vec<_>>().join(","));
        }
        if !usns.is_empty() {
            metric = metric.field("usn", usns.into_iter().next().unwrap_or_default());
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<SsdpAdapter>));
