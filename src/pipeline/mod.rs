//! The three-stage pipeline: sweep, post-process, traverse. Stages are
//! strictly sequential; each fans out internally with bounded concurrency
//! and drains completely before the next begins.

use anyhow::Error;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

pub mod aggregator;
pub mod postprocess;
pub mod rdns;
pub mod traverser;

use crate::config::ScanConfig;
use crate::output::{self, ScanReport};
use crate::registry;
use crate::scan::orchestrator;
use crate::scan::range::ScanRange;

pub async fn run(
    range: &ScanRange,
    config: &ScanConfig,
    cancel: CancellationToken,
) -> Result<ScanReport, Error> {
    let started = Utc::now();
    registry::clear();
    let aggregator = aggregator::Aggregator::new();

    // Stage 1: the sweeps
    let sweep = orchestrator::run_all_scans(range, config, &aggregator, cancel).await?;

    // Stage 2: reclassification, then reverse DNS
    aggregator.with_map(postprocess::apply).await;
    rdns::resolve_all(&aggregator).await;

    // Stage 3: protocol adapters
    let traverser_report = traverser::traverse(&aggregator, config).await;

    let hosts = aggregator.into_map().await;
    let duration_s = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;

    tracing::info!(
        "scan of {} complete: {} hosts, {} alive, {:.2}s",
        range,
        hosts.len(),
        sweep.alive_hosts,
        duration_s
    );

    let report = output::build_report(
        range,
        duration_s,
        sweep.performance,
        hosts,
        traverser_report,
    );
    registry::clear();
    Ok(report)
}
