//! Adapter around the external TCP port-sweep binary. The tool receives the
//! expanded address list and the port list, and streams line-delimited JSON
//! results on stdout. Completion requires both stdout EOF and process exit.

use std::net::Ipv4Addr;
use std::path::Path;
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
struct TcpScanLine {
    ip: Ipv4Addr,
    port: u16,
}

/// Load the comma-separated port list resource. Malformed content is a
/// configuration error, not a per-host one.
pub fn load_port_list(path: &Path) -> Result<Vec<u16>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::PortTableRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mut ports = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let port: u16 = token
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ConfigError::PortTableMalformed {
                path: path.to_path_buf(),
                token: token.to_string(),
            })?;
        ports.push(port);
    }
    Ok(ports)
}

/// Run the external sweep over `targets`, feeding found ports into the
/// aggregator with their default labels. Returns (ports found, hosts with
/// at least one port).
pub async fn sweep(
    targets: &[Ipv4Addr],
    config: &ScanConfig,
    aggregator: &Aggregator,
) -> Result<(usize, usize), Error> {
    let ports = load_port_list(&config.tcp_ports_resource)?;
    let address_list = targets.iter().join(",");
    let port_list = ports.iter().join(",");

    let mut child = Command::new(&config.tcp_scanner_path)
        .arg("--targets")
        .arg(&address_list)
        .arg("--ports")
        .arg(&port_list)
        .arg("--concurrency")
        .arg(config.tcp_scanner_concurrency.to_string())
        .arg("--json")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| ConfigError::ScannerSpawn {
            path: config.tcp_scanner_path.clone(),
            source,
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("[ERR]") || line.contains("[FTL]") {
                tracing::error!("tcp scanner: {}", line);
            }
        }
    });

    let mut ports_found = 0usize;
    let mut hosts = std::collections::HashSet::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<TcpScanLine>(line) {
            Ok(found) => {
                let label = lookup::tcp_label(found.port).map(str::to_string);
                tracing::debug!(
                    "open tcp {}:{}{}",
                    found.ip,
                    found.port,
                    label.as_deref().map(|l| format!(" ({l})")).unwrap_or_default()
                );
                aggregator
                    .add_port(found.ip, Transport::Tcp, found.port, label)
                    .await;
                ports_found += 1;
                hosts.insert(found.ip);
            }
            Err(e) => tracing::trace!("unparseable tcp scanner line '{}': {}", line, e),
        }
    }

    // Stdout EOF alone is not completion; the process must also exit.
    let status = child.wait().await?;
    let _ = stderr_task.await;
    tracing::debug!("tcp scanner exited with {} (ignored)", status);

    Ok((ports_found, hosts.len()))
}
