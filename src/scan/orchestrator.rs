//! Sweep orchestration: the ICMP, TCP, UDP and UDP-extra sweeps run
//! concurrently over the same target range, each recording its own
//! performance window. A sub-sweep is fatal only when its underlying tool
//! cannot start; per-target misses are silent.

use anyhow::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::pipeline::aggregator::{Aggregator, Performance};
use crate::scan::range::ScanRange;
use crate::scan::{icmp, tcp, udp, udp_extra};

pub struct SweepOutcome {
    pub performance: Performance,
    pub alive_hosts: usize,
}

/// Fan out all four sweeps and wait for full drain.
pub async fn run_all_scans(
    range: &ScanRange,
    config: &ScanConfig,
    aggregator: &Aggregator,
    cancel: CancellationToken,
) -> Result<SweepOutcome, Error> {
    let targets = range.hosts();
    let mut performance = Performance::default();

    tracing::info!(
        "sweeping {} ({} hosts: icmp + tcp + udp + udp-extra)",
        range,
        targets.len()
    );

    let icmp_task = async {
        let mut window = crate::pipeline::aggregator::StageWindow::default();
        window.begin();
        let alive = icmp::sweep(targets.clone(), config, aggregator, cancel.clone()).await?;
        window.finish(alive, 0, 0);
        tracing::info!("icmp sweep done: {} alive in {:.2}s", alive, window.duration_s);
        Ok::<_, Error>((window, alive))
    };

    let tcp_task = async {
        let mut window = crate::pipeline::aggregator::StageWindow::default();
        window.begin();
        let (ports, hosts) = tcp::sweep(&targets, config, aggregator).await?;
        window.finish(hosts, ports, hosts);
        tracing::info!(
            "tcp sweep done: {} ports on {} hosts in {:.2}s",
            ports,
            hosts,
            window.duration_s
        );
        Ok::<_, Error>(window)
    };

    let udp_task = async {
        let mut window = crate::pipeline::aggregator::StageWindow::default();
        window.begin();
        let (generic, extra) = tokio::join!(
            udp::sweep(&targets, config, aggregator),
            udp_extra::sweep(&targets, config, aggregator, cancel.clone()),
        );
        let (ports, hosts) = generic?;
        let (extra_ports, extra_hosts) = extra?;
        window.finish(
            hosts.max(extra_hosts),
            ports + extra_ports,
            hosts.max(extra_hosts),
        );
        tracing::info!(
            "udp sweep done: {} ports ({} native) in {:.2}s",
            ports + extra_ports,
            extra_ports,
            window.duration_s
        );
        Ok::<_, Error>(window)
    };

    let (icmp_result, tcp_result, udp_result) = tokio::join!(icmp_task, tcp_task, udp_task);

    let (ping_window, alive_hosts) = icmp_result?;
    performance.ping = ping_window;
    performance.tcp = tcp_result?;
    performance.udp = udp_result?;

    Ok(SweepOutcome {
        performance,
        alive_hosts,
    })
}
