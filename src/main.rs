use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hostscout::config::ScanConfig;
use hostscout::pipeline;
use hostscout::privilege;
use hostscout::scan::range::ScanRange;

#[derive(Parser)]
#[command(name = "hostscout")]
#[command(about = "Agentless subnet discovery and service classification")]
struct Cli {
    /// Subnet prefix (A.B.C) or explicit range (A.B.C.S-E)
    subnet: String,

    /// Per-adapter wall-clock timeout in seconds
    #[arg(long)]
    adapter_timeout: Option<u64>,

    /// Hosts traversed in parallel
    #[arg(long)]
    host_concurrency: Option<usize>,

    /// Path to the external TCP port-sweep binary
    #[arg(long)]
    tcp_scanner: Option<std::path::PathBuf>,

    /// Path to the external UDP port-sweep binary
    #[arg(long)]
    udp_scanner: Option<std::path::PathBuf>,

    /// Verbose adapter logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> (String, ScanConfig) {
        let mut config = ScanConfig::default();
        if let Some(secs) = self.adapter_timeout {
            config.per_adapter_timeout = std::time::Duration::from_secs(secs.max(1));
        }
        if let Some(hosts) = self.host_concurrency {
            config.traverse_host_concurrency = hosts.max(1);
        }
        if let Some(path) = self.tcp_scanner {
            config.tcp_scanner_path = path;
        }
        if let Some(path) = self.udp_scanner {
            config.udp_scanner_path = path;
        }
        config.verbose = self.verbose;
        (self.subnet, config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the result document; all logging goes to stderr.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = privilege::ensure_elevated() {
        tracing::error!("{}", e);
        return ExitCode::from(1);
    }

    let (subnet, config) = cli.into_config();
    let range: ScanRange = match subnet.parse() {
        Ok(range) => range,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping new probes");
            signal_cancel.cancel();
        }
    });

    match pipeline::run(&range, &config, cancel).await {
        Ok(report) => match hostscout::output::render(&report) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("failed to serialize result: {}", e);
                ExitCode::from(1)
            }
        },
        Err(e) => {
            tracing::error!("scan failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
