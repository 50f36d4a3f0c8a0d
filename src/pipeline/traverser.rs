//! The traversal stage: maps each host's discovered service labels to
//! protocol adapters and runs them under bounded concurrency, aggregating
//! non-empty payloads back onto the host record.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterRegistry, ProbeOptions, flatten_metrics};
use crate::config::ScanConfig;
use crate::pipeline::aggregator::{Aggregator, HostRecord, Transport};
use crate::scan::batch::batch_scan;

/// Classification adapters are queued ahead of the rest so their device
/// registry writes have a chance to land before gated adapters run.
const CLASSIFIERS: &[&str] = &["mdns", "snmp"];

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedProbe {
    pub adapter: &'static str,
    pub transport: Transport,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraverserReport {
    #[serde(rename = "duration")]
    pub duration_s: f64,
    pub hosts_processed: usize,
}

/// Build the probe list for one host: every labelled port is looked up in
/// the adapter table, deduplicated by adapter name.
pub fn plan_for_host(record: &HostRecord) -> Vec<PlannedProbe> {
    let mut planned = Vec::new();
    let mut taken: HashSet<&'static str> = HashSet::new();

    let tables = [
        (Transport::Tcp, &record.ports.tcp),
        (Transport::Udp, &record.ports.udp),
    ];
    for (transport, table) in tables {
        for (port, label) in table.iter() {
            let Some(label) = label.as_deref() else {
                continue;
            };
            let Some(adapter) = AdapterRegistry::for_label(label) else {
                continue;
            };
            let name = adapter.name();
            if !taken.insert(name) {
                tracing::debug!(
                    "adapter {} already planned for this host, dropping {} {}",
                    name,
                    transport,
                    port
                );
                continue;
            }
            planned.push(PlannedProbe {
                adapter: name,
                transport,
                port: *port,
            });
        }
    }

    // Stable partition: classifiers first, everything else in table order.
    planned.sort_by_key(|probe| !CLASSIFIERS.contains(&probe.adapter));
    planned
}

async fn run_host(
    ip: Ipv4Addr,
    planned: Vec<PlannedProbe>,
    aggregator: &Aggregator,
    config: &ScanConfig,
) {
    let per_adapter_timeout = config.per_adapter_timeout;
    let adapter_concurrency = config.traverse_adapter_concurrency;
    let verbose = config.verbose;

    let results = batch_scan(
        planned,
        adapter_concurrency,
        CancellationToken::new(),
        move |probe| async move {
            let adapter = AdapterRegistry::find_by_name(probe.adapter)?;
            let mut options = ProbeOptions::with_timeout(per_adapter_timeout);
            options.verbose = verbose;
            if options.verbose {
                tracing::debug!("running {} against {}:{}", probe.adapter, ip, probe.port);
            }
            let started = Utc::now();

            let metrics = match tokio::time::timeout(
                per_adapter_timeout,
                adapter.discover(ip, probe.port, &options),
            )
            .await
            {
                Ok(metrics) => metrics,
                Err(_) => {
                    tracing::debug!(
                        "adapter {} on {}:{} hit the {}s wall clock",
                        probe.adapter,
                        ip,
                        probe.port,
                        per_adapter_timeout.as_secs()
                    );
                    return None;
                }
            };

            if metrics.is_empty() {
                return None;
            }
            tracing::debug!(
                "adapter {} on {}:{} returned {} metrics in {}ms",
                probe.adapter,
                ip,
                probe.port,
                metrics.len(),
                (Utc::now() - started).num_milliseconds()
            );
            Some((probe.adapter, flatten_metrics(&metrics)))
        },
    )
    .await;

    for (adapter_name, payload) in results {
        aggregator.set_adapter_payload(ip, adapter_name, payload).await;
    }
}

/// Run the subset of adapters whose registered services appear on each
/// host, across all hosts, and report the stage window.
pub async fn traverse(aggregator: &Aggregator, config: &ScanConfig) -> TraverserReport {
    let started = Utc::now();
    let snapshot = aggregator.snapshot().await;

    let work: Vec<(Ipv4Addr, Vec<PlannedProbe>)> = snapshot
        .iter()
        .map(|(ip, record)| (*ip, plan_for_host(record)))
        .filter(|(_, planned)| !planned.is_empty())
        .collect();

    tracing::info!(
        "traversing {} hosts ({} with matching adapters)",
        snapshot.len(),
        work.len()
    );

    let hosts_processed = stream::iter(work)
        .map(|(ip, planned)| async move {
            run_host(ip, planned, aggregator, config).await;
        })
        .buffer_unordered(config.traverse_host_concurrency)
        .count()
        .await;

    let stats = crate::registry::stats();
    tracing::info!(
        "traversal done: {} hosts, registry has {} entries ({} printers)",
        hosts_processed,
        stats.entries,
        stats.printers
    );

    TraverserReport {
        duration_s: (Utc::now() - started).num_milliseconds() as f64 / 1000.0,
        hosts_processed,
    }
}
