//! Adapter around the external UDP port-sweep binary. The tool may stream
//! newline-delimited JSON results or emit one JSON array at end-of-stream;
//! both shapes are accepted. Results are deduplicated by (ip, port).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Stdio;

use anyhow::{Error, Result};
use itertools::Itertools;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::ScanConfig;
use crate::error::ConfigError;
use crate::lookup;
use crate::pipeline::aggregator::{Aggregator, Transport};

#[derive(Debug, Deserialize)]
struct SlugRef {
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UdpScanResult {
    ip: Ipv4Addr,
    port: u16,
    #[serde(default)]
    service: Option<SlugRef>,
    #[serde(default)]
    probe: Option<SlugRef>,
}

impl UdpScanResult {
    /// Tool label wins over the table, which wins over "unknown".
    fn label(&self) -> String {
        let tool_label = self
            .service
            .as_ref()
            .and_then(|s| s.slug.as_deref())
            .filter(|s| !s.is_empty() && *s != "unknown")
            .or_else(|| {
                self.probe
                    .as_ref()
                    .and_then(|p| p.slug.as_deref())
                    .filter(|s| !s.is_empty() && *s != "unknown")
            });
        lookup::resolve_udp_label(tool_label, self.port)
    }
}

fn parse_output(raw: &str) -> Vec<UdpScanResult> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        // Single array at end-of-stream
        match serde_json::from_str::<Vec<UdpScanResult>>(trimmed) {
            Ok(results) => results,
            Err(e) => {
                tracing::trace!("udp scanner array output unparseable: {}", e);
                Vec::new()
            }
        }
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|line| match serde_json::from_str::<UdpScanResult>(line) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::trace!("unparseable udp scanner line '{}': {}", line, e);
                    None
                }
            })
            .collect()
    }
}

/// Run the external UDP sweep. Returns (ports found, hosts with ports).
pub async fn sweep(
    targets: &[Ipv4Addr],
    config: &ScanConfig,
    aggregator: &Aggregator,
) -> Result<(usize, usize), Error> {
    let address_list = targets.iter().join(",");

    let mut child = Command::new(&config.udp_scanner_path)
        .arg("--targets")
        .arg(&address_list)
        .arg("--host-concurrency")
        .arg(config.udp_host_concurrency.to_string())
        .arg("--port-concurrency")
        .arg(config.udp_port_concurrency.to_string())
        .arg("--timeout-ms")
        .arg(config.udp_timeout.as_millis().to_string())
        .arg("--retries")
        .arg(config.udp_retries.to_string())
        .arg("--json")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| ConfigError::ScannerSpawn {
            path: config.udp_scanner_path.clone(),
            source,
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("[ERR]") || line.contains("[FTL]") {
                tracing::error!("udp scanner: {}", line);
            }
        }
    });

    // Buffer everything: array-at-EOF output cannot be parsed line by line.
    let mut raw = String::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        raw.push_str(&line);
        raw.push('\n');
    }

    let status = child.wait().await?;
    let _ = stderr_task.await;
    tracing::debug!("udp scanner exited with {} (ignored)", status);

    let mut seen: HashSet<(Ipv4Addr, u16)> = HashSet::new();
    let mut hosts = HashSet::new();
    for result in parse_output(&raw) {
        if !seen.insert((result.ip, result.port)) {
            continue;
        }
        let label = result.label();
        tracing::debug!("open udp {}:{} ({})", result.ip, result.port, label);
        aggregator
            .add_port(result.ip, Transport::Udp, result.port, Some(label))
            .await;
        hosts.insert(result.ip);
    }

    Ok((seen.len(), hosts.len()))
}
