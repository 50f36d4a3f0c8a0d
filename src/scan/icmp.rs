//! ICMP liveness sweep built on the platform ping binary. One echo request
//! per attempt, bounded in-flight count, latency pulled out of the captured
//! output.

use std::net::Ipv4Addr;

use anyhow::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::pipeline::aggregator::Aggregator;
use crate::scan::batch::batch_scan;

lazy_static! {
    static ref LATENCY_RE: Regex =
        Regex::new(r"(?i)time\s*[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").unwrap();
    static ref WIN_AVG_RE: Regex =
        Regex::new(r"(?i)average\s*=\s*([0-9]+(?:\.[0-9]+)?)\s*ms").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingOutcome {
    pub alive: bool,
    pub latency_ms: Option<f64>,
}

fn ping_command(ip: Ipv4Addr, timeout_ms: u64) -> Command {
    let mut cmd = Command::new("ping");
    #[cfg(target_os = "windows")]
    cmd.args(["-n", "1", "-w", &timeout_ms.to_string()]);
    #[cfg(target_os = "macos")]
    cmd.args(["-c", "1", "-W", &timeout_ms.to_string()]);
    #[cfg(all(unix, not(target_os = "macos")))]
    cmd.args(["-c", "1", "-W", &timeout_ms.div_ceil(1000).max(1).to_string()]);
    cmd.arg(ip.to_string());
    cmd
}

fn looks_alive(status_ok: bool, output: &str) -> bool {
    status_ok
        || output.contains("Reply from")
        || output.contains("bytes=")
        || output.contains("bytes from")
        || output.contains("1 received")
        || output.contains("1 packets received")
}

pub fn extract_latency_ms(output: &str) -> Option<f64> {
    LATENCY_RE
        .captures(output)
        .or_else(|| WIN_AVG_RE.captures(output))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Single ping attempt. An error here means the ping binary itself could not
/// be spawned, which is fatal for the whole sweep.
async fn ping_once(ip: Ipv4Addr, timeout_ms: u64) -> Result<PingOutcome> {
    let output = ping_command(ip, timeout_ms).output().await?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let alive = looks_alive(output.status.success(), &text);
    let latency_ms = if alive { extract_latency_ms(&text) } else { None };
    Ok(PingOutcome { alive, latency_ms })
}

async fn ping_with_retries(ip: Ipv4Addr, timeout_ms: u64, retries: usize) -> Result<PingOutcome> {
    let mut outcome = ping_once(ip, timeout_ms).await?;
    let mut attempts = 0;
    while !outcome.alive && attempts < retries {
        attempts += 1;
        tracing::trace!("ping {} retry {}/{}", ip, attempts, retries);
        outcome = ping_once(ip, timeout_ms).await?;
    }
    Ok(outcome)
}

/// Sweep every target, recording alive hosts (and their latency) into the
/// aggregator. Returns the number of alive hosts.
pub async fn sweep(
    targets: Vec<Ipv4Addr>,
    config: &ScanConfig,
    aggregator: &Aggregator,
    cancel: CancellationToken,
) -> Result<usize, Error> {
    let timeout_ms = config.icmp_timeout.as_millis() as u64;
    let retries = config.icmp_retries;

    let results = batch_scan(
        targets,
        config.icmp_concurrency,
        cancel,
        |ip| async move {
            match ping_with_retries(ip, timeout_ms, retries).await {
                Ok(outcome) => Some((ip, outcome)),
                Err(e) => {
                    tracing::error!("ping spawn failed for {}: {}", ip, e);
                    None
                }
            }
        },
    )
    .await;

    let mut alive = 0usize;
    for (ip, outcome) in results {
        if outcome.alive {
            alive += 1;
            tracing::debug!(
                "host {} alive{}",
                ip,
                outcome
                    .latency_ms
                    .map(|l| format!(" ({l:.2} ms)"))
                    .unwrap_or_default()
            );
        }
        aggregator.mark_ping(ip, outcome.alive, outcome.latency_ms).await;
    }

    Ok(alive)
}
