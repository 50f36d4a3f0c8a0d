//! SNMP identification. Three version attempts run concurrently: v2c and v1
//! sessions using `GET sysDescr.0` as the liveness test, and a raw v3
//! engine-discovery probe. The winner is v2c over v1 over v3, with v3's
//! engine metadata merged in as supplementary fields whenever it succeeds.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::Rng;
use snmp2::{AsyncSession, Oid, Value};
use tokio::time::timeout;

use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

pub mod v3;
pub mod vendors;

const COMMUNITY: &[u8] = b"public";
const SYSTEM_SUBTREE: &str = "1.3.6.1.2.1.1";
const SYS_OBJECT_ID: &str = "1.3.6.1.2.1.1.2.0";
const IF_DESCR_SUBTREE: &str = "1.3.6.1.2.1.2.2.1.2";
const ARP_PHYS_SUBTREE: &str = "1.3.6.1.2.1.4.22.1.2";
const PRINTER_MIB: &str = "1.3.6.1.2.1.43";
const WALK_CAP: usize = 32;

fn oid_from_str(dotted: &str) -> Result<Oid<'static>> {
    let parts: Vec<u64> = dotted
        .split('.')
        .map(|p| p.parse::<u64>().map_err(|_| anyhow!("bad oid arc '{}'", p)))
        .collect::<Result<_>>()?;
    Oid::from(&parts).map_err(|e| anyhow!("invalid oid {}: {:?}", dotted, e))
}

fn in_subtree(base: &str, oid: &str) -> bool {
    oid == base || oid.starts_with(&format!("{base}."))
}

/// Octet strings that are actually MAC addresses arrive padded and
/// unprintable; render those as hex pairs.
fn octets_to_json(raw: &[u8]) -> serde_json::Value {
    let printable = raw
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ' || *b == b'\t');
    if printable && !raw.is_empty() {
        serde_json::Value::String(String::from_utf8_lossy(raw).trim().to_string())
    } else {
        serde_json::Value::String(
            raw.iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::OctetString(raw) => octets_to_json(raw),
        Value::ObjectIdentifier(oid) => serde_json::Value::String(oid.to_string()),
        Value::IpAddress(octets) => serde_json::Value::String(
            Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string(),
        ),
        Value::Counter32(v) => serde_json::Value::from(*v),
        Value::Unsigned32(v) => serde_json::Value::from(*v),
        Value::Timeticks(v) => serde_json::Value::from(*v),
        Value::Counter64(v) => serde_json::Value::from(*v),
        _ => serde_json::Value::Null,
    }
}

async fn get_one(
    session: &mut AsyncSession,
    dotted: &str,
    step: Duration,
) -> Result<serde_json::Value> {
    let oid = oid_from_str(dotted)?;
    let mut pdu = timeout(step, session.get(&oid))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    let (_, value) = pdu
        .varbinds
        .next()
        .ok_or_else(|| anyhow!("empty varbind list"))?;
    match value {
        Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => {
            Err(anyhow!("no such object"))
        }
        other => Ok(value_to_json(&other)),
    }
}

async fn walk_subtree(
    session: &mut AsyncSession,
    base: &str,
    cap: usize,
    step: Duration,
) -> Vec<(String, serde_json::Value)> {
    let mut results = Vec::new();
    let Ok(mut current) = oid_from_str(base) else {
        return results;
    };

    for _ in 0..cap {
        let mut pdu = match timeout(step, session.getnext(&current)).await {
            Ok(Ok(pdu)) => pdu,
            _ => break,
        };
        let Some((oid, value)) = pdu.varbinds.next() else {
            break;
        };
        let oid_str = oid.to_string();
        if !in_subtree(base, &oid_str) {
            break;
        }
        if matches!(value, Value::EndOfMibView) {
            break;
        }
        results.push((oid_str.clone(), value_to_json(&value)));
        match oid_from_str(&oid_str) {
            Ok(next) => current = next,
            Err(_) => break,
        }
    }
    results
}

#[derive(Debug, Default)]
struct SnmpIdentity {
    sys_descr: Option<String>,
    sys_object_id: Option<String>,
    sys_name: Option<String>,
    sys_contact: Option<String>,
    sys_location: Option<String>,
    uptime_ticks: Option<i64>,
    vendor: Option<&'static str>,
    vendor_oid_values: usize,
    interface_count: usize,
    arp_macs: Vec<String>,
    is_printer: bool,
}

/// Full identification walk over one established session.
async fn identify(session: &mut AsyncSession, step: Duration) -> SnmpIdentity {
    let mut identity = SnmpIdentity::default();

    for (oid_str, value) in walk_subtree(session, SYSTEM_SUBTREE, 16, step).await {
        let text = value.as_str().map(str::to_string);
        match oid_str.as_str() {
            "1.3.6.1.2.1.1.1.0" => identity.sys_descr = text,
            "1.3.6.1.2.1.1.2.0" => identity.sys_object_id = text,
            "1.3.6.1.2.1.1.3.0" => identity.uptime_ticks = value.as_i64(),
            "1.3.6.1.2.1.1.4.0" => identity.sys_contact = text,
            "1.3.6.1.2.1.1.5.0" => identity.sys_name = text,
            "1.3.6.1.2.1.1.6.0" => identity.sys_location = text,
            _ => {}
        }
    }

    if identity.sys_object_id.is_none() {
        identity.sys_object_id = get_one(session, SYS_OBJECT_ID, step)
            .await
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
    }

    if let Some(sys_object_id) = &identity.sys_object_id {
        if let Some(entry) = vendors::vendor_for(sys_object_id) {
            identity.vendor = Some(entry.vendor);
            for prefix in vendors::collapse_prefixes(entry.walk_prefixes) {
                identity.vendor_oid_values +=
                    walk_subtree(session, prefix, 16, step).await.len();
            }
        }
    }

    identity.interface_count = walk_subtree(session, IF_DESCR_SUBTREE, WALK_CAP, step)
        .await
        .len();
    identity.arp_macs = walk_subtree(session, ARP_PHYS_SUBTREE, WALK_CAP, step)
        .await
        .into_iter()
        .filter_map(|(_, v)| v.as_str().map(str::to_string))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    // A getNext inside the Printer-MIB prefix means the device implements it.
    if let Ok(oid) = oid_from_str(PRINTER_MIB) {
        if let Ok(Ok(mut pdu)) = timeout(step, session.getnext(&oid)).await {
            if let Some((oid, _)) = pdu.varbinds.next() {
                identity.is_printer = in_subtree(PRINTER_MIB, &oid.to_string());
            }
        }
    }

    identity
}

enum SessionVersion {
    V1,
    V2c,
}

async fn try_session(
    host: Ipv4Addr,
    port: u16,
    version: SessionVersion,
    budget: Duration,
) -> Option<SnmpIdentity> {
    let target = format!("{host}:{port}");
    let step = (budget / 8).max(Duration::from_millis(300));

    let mut session = match version {
        SessionVersion::V2c => AsyncSession::new_v2c(&target, COMMUNITY, 0).await.ok()?,
        SessionVersion::V1 => AsyncSession::new_v1(&target, COMMUNITY, 0).await.ok()?,
    };

    // Liveness gate before any walking.
    get_one(&mut session, "1.3.6.1.2.1.1.1.0", step).await.ok()?;
    Some(identify(&mut session, step).await)
}

async fn try_v3_discovery(host: Ipv4Addr, port: u16, budget: Duration) -> Option<v3::V3Discovery> {
    let request_id: u32 = rand::rng().random_range(1..=0x7FFF_FFFF);
    let probe = v3::build_discovery(request_id);
    let target = SocketAddr::from((host, port));
    let raw = super::util::udp_exchange(target, &probe, budget).await.ok()??;
    v3::parse_discovery_response(&raw).ok()
}

#[derive(Default)]
pub struct SnmpAdapter;

#[async_trait]
impl Adapter for SnmpAdapter {
    fn name(&self) -> &'static str {
        "snmp"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["snmp"]
    }

    fn default_port(&self) -> u16 {
        161
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let budget = options.slice(0.9);

        let (v2c, v1, v3_result) = tokio::join!(
            try_session(host, port, SessionVersion::V2c, budget),
            try_session(host, port, SessionVersion::V1, budget),
            try_v3_discovery(host, port, budget),
        );

        let v2c_success = v2c.is_some();
        let v1_success = v1.is_some();
        let v3_success = v3_result.is_some();

        let (version, identity) = match (v2c, v1) {
            (Some(identity), _) => ("v2c", Some(identity)),
            (None, Some(identity)) => ("v1", Some(identity)),
            (None, None) if v3_success => ("v3", None),
            _ => return Vec::new(),
        };

        let mut metric = Metric::new("snmp")
            .tag("port", &port.to_string())
            .field("version", version)
            .field("snmp_v2c_attempted", true)
            .field("snmp_v2c_success", v2c_success)
            .field("snmp_v1_attempted", true)
            .field("snmp_v1_success", v1_success)
            .field("snmp_v3_attempted", true)
            .field("snmp_v3_success", v3_success);

        if let Some(identity) = identity {
            if identity.is_printer {
                let mut details = serde_json::Map::new();
                if let Some(descr) = &identity.sys_descr {
                    details.insert("sysDescr".into(), serde_json::Value::String(descr.clone()));
                }
                registry::mark_printer(host, "snmp", details);
            }

            metric = metric
                .field_opt("sysDescr", identity.sys_descr.as_deref())
                .field_opt("sysObjectID", identity.sys_object_id.as_deref())
                .field_opt("sysName", identity.sys_name.as_deref())
                .field_opt("sysContact", identity.sys_contact.as_deref())
                .field_opt("sysLocation", identity.sys_location.as_deref())
                .field_opt("uptime_ticks", identity.uptime_ticks)
                .field_opt("vendor", identity.vendor)
                .field("interfaces", identity.interface_count as i64)
                .field("arp_entries", identity.arp_macs.len() as i64)
                .field("printer_mib", identity.is_printer);
            if identity.vendor_oid_values > 0 {
                metric = metric.field("vendor_oid_values", identity.vendor_oid_values as i64);
            }
            if !identity.arp_macs.is_empty() {
                metric = metric.field("arp_macs", identity.arp_macs.join(","));
            }
        }

        if let Some(discovery) = v3_result {
            metric = metric
                .field("engine_boots", discovery.engine_boots as i64)
                .field("engine_time", discovery.engine_time as i64)
                .field(
                    "engine_id",
                    discovery
                        .engine_id
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>(),
                );
            if let Ok(engine) = v3::EngineId::decode(&discovery.engine_id) {
                metric = metric
                    .field("engine_enterprise", engine.enterprise as i64)
                    .field("engine_format", engine.describe());
            }
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<SnmpAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtree_membership_respects_arc_boundaries() {
        assert!(in_subtree("1.3.6.1.2.1.43", "1.3.6.1.2.1.43.5.1.1.1"));
        assert!(in_subtree("1.3.6.1.2.1.43", "1.3.6.1.2.1.43"));
        assert!(!in_subtree("1.3.6.1.2.1.4", "1.3.6.1.2.1.43.5"));
        assert!(!in_subtree("1.3.6.1.2.1.43", "1.3.6.1.2.1.44.1"));
    }

    #[test]
    fn mac_octets_render_as_hex_pairs() {
        let rendered = octets_to_json(&[0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]);
        assert_eq!(rendered, "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn printable_octets_render_as_text() {
        let rendered = octets_to_json(b"Linux router 5.15.0");
        assert_eq!(rendered, "Linux router 5.15.0");
    }

    #[test]
    fn oid_parsing() {
        assert!(oid_from_str("1.3.6.1.2.1.1.1.0").is_ok());
        assert!(oid_from_str("1.3.banana").is_err());
    }

    #[tokio::test]
    async fn v3_discovery_against_local_fixture() {
        // A fake agent that replies to any v3 probe with a fixed engine.
        let agent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = agent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, from) = agent.recv_from(&mut buf).await.unwrap();
            // The probe must itself be a parseable v3 message.
            let mut reader = v3::BerReader::new(&buf[..n]);
            assert!(reader.expect(0x30).is_ok());

            let engine_id = [0x80, 0x00, 0x1F, 0x88, 0x01, 192, 0, 2, 1];
            let response = {
                // Reuse the adapter's own builder shape by crafting a
                // response with the engine parameters filled in.
                let discovery = v3::build_discovery(1);
                // Splice: simplest correct approach is rebuilding with the
                // test fixture helper, so just parse-fail here if the build
                // shape drifts.
                drop(discovery);
                v3_response_fixture(&engine_id, 3, 42)
            };
            agent.send_to(&response, from).await.unwrap();
        });

        let discovery = try_v3_discovery(
            Ipv4Addr::new(127, 0, 0, 1),
            port,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(discovery.engine_boots, 3);
        assert_eq!(discovery.engine_time, 42);
        let engine = v3::EngineId::decode(&discovery.engine_id).unwrap();
        assert_eq!(engine.enterprise, 8072);
        assert_eq!(
            engine.format,
            v3::EngineIdFormat::Ipv4(Ipv4Addr::new(192, 0, 2, 1))
        );
    }

    fn v3_response_fixture(engine_id: &[u8], boots: u32, time: u32) -> Vec<u8> {
        fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
            let mut out = vec![tag, content.len() as u8];
            out.extend_from_slice(content);
            out
        }
        fn int(v: u32) -> Vec<u8> {
            let bytes = v.to_be_bytes();
            let mut start = 0;
            while start < 3 && bytes[start] == 0 && bytes[start + 1] & 0x80 == 0 {
                start += 1;
            }
            tlv(0x02, &bytes[start..])
        }

        let header = {
            let mut inner = int(v3::DISCOVERY_MSG_ID);
            inner.extend(int(65507));
            inner.extend(tlv(0x04, &[0x00]));
            inner.extend(int(3));
            tlv(0x30, &inner)
        };
        let usm = {
            let mut inner = tlv(0x04, engine_id);
            inner.extend(int(boots));
            inner.extend(int(time));
            inner.extend(tlv(0x04, &[]));
            inner.extend(tlv(0x04, &[]));
            inner.extend(tlv(0x04, &[]));
            tlv(0x04, &tlv(0x30, &inner))
        };
        let scoped = {
            let mut inner = tlv(0x04, engine_id);
            inner.extend(tlv(0x04, &[]));
            inner.extend(tlv(0xA8, &[]));
            tlv(0x30, &inner)
        };
        let mut body = int(3);
        body.extend(header);
        body.extend(usm);
        body.extend(scoped);
        tlv(0x30, &body)
    }
}
