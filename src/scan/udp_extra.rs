//! Native UDP probes for the protocols generic port-sweep tools miss:
//! SSDP (1900) and WS-Discovery (3702). A target is probed once per
//! protocol; only positive results reach the aggregator.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use crate::adapters::{ssdp, wsd};
use crate::config::ScanConfig;
use crate::pipeline::aggregator::{Aggregator, Transport};
use crate::scan::batch::batch_scan;

#[derive(Debug, Clone, Copy)]
pub struct ExtraProtocol {
    pub port: u16,
    pub label: &'static str,
}

pub const EXTRA_PROTOCOLS: &[ExtraProtocol] = &[
    ExtraProtocol { port: ssdp::SSDP_PORT, label: "ssdp" },
    ExtraProtocol { port: wsd::WSD_PORT, label: "wsd" },
];

fn payload_for(port: u16) -> Vec<u8> {
    if port == wsd::WSD_PORT {
        wsd::probe_payload()
    } else {
        ssdp::msearch_payload()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub label: &'static str,
    pub details: Option<String>,
}

/// Probe one target for one protocol: a single datagram, first reply wins.
async fn probe_target(
    ip: Ipv4Addr,
    protocol: ExtraProtocol,
    wait: Duration,
) -> Option<ProbeHit> {
    let target = SocketAddr::from((ip, protocol.port));
    let payload = payload_for(protocol.port);
    match crate::adapters::util::udp_exchange(target, &payload, wait).await {
        Ok(Some(raw)) => {
            let details = String::from_utf8_lossy(&raw)
                .lines()
                .next()
                .map(str::to_string);
            Some(ProbeHit {
                ip,
                port: protocol.port,
                label: protocol.label,
                details,
            })
        }
        Ok(None) => None,
        Err(e) => {
            tracing::trace!("udp-extra {} probe {} - {}", protocol.label, ip, e);
            None
        }
    }
}

/// Sweep all targets for all registered protocols. Returns (ports found,
/// hosts with at least one hit).
pub async fn sweep(
    targets: &[Ipv4Addr],
    config: &ScanConfig,
    aggregator: &Aggregator,
    cancel: CancellationToken,
) -> Result<(usize, usize), Error> {
    let wait = config.udp_extra_timeout;

    let work: Vec<(Ipv4Addr, ExtraProtocol)> = targets
        .iter()
        .flat_map(|ip| EXTRA_PROTOCOLS.iter().map(|protocol| (*ip, *protocol)))
        .collect();

    let hits = batch_scan(
        work,
        config.udp_extra_concurrency,
        cancel,
        move |(ip, protocol)| async move { probe_target(ip, protocol, wait).await },
    )
    .await;

    let mut hosts = std::collections::HashSet::new();
    for hit in &hits {
        tracing::debug!("udp-extra hit {}:{} ({})", hit.ip, hit.port, hit.label);
        aggregator
            .add_port(hit.ip, Transport::Udp, hit.port, Some(hit.label.to_string()))
            .await;
        hosts.insert(hit.ip);
    }

    Ok((hits.len(), hosts.len()))
}
