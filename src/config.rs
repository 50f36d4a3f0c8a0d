//! Run configuration. Everything here is compile-time defaulted; the CLI may
//! override individual knobs but there is no config file.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// In-flight pings during the ICMP sweep.
    pub icmp_concurrency: usize,
    /// Per-ping wait before a retry is considered.
    pub icmp_timeout: Duration,
    /// Extra attempts after a negative ping result.
    pub icmp_retries: usize,

    /// External TCP port-sweep binary.
    pub tcp_scanner_path: PathBuf,
    /// Concurrency flag handed to the TCP scanner.
    pub tcp_scanner_concurrency: usize,
    /// Comma-separated TCP port list resource.
    pub tcp_ports_resource: PathBuf,

    /// External UDP port-sweep binary.
    pub udp_scanner_path: PathBuf,
    /// Host-level concurrency flag handed to the UDP scanner.
    pub udp_host_concurrency: usize,
    /// Per-host port-task concurrency flag handed to the UDP scanner.
    pub udp_port_concurrency: usize,
    pub udp_timeout: Duration,
    pub udp_retries: usize,

    /// Targets probed at once by the native SSDP/WS-Discovery prober.
    pub udp_extra_concurrency: usize,
    pub udp_extra_timeout: Duration,

    /// Hosts traversed in parallel.
    pub traverse_host_concurrency: usize,
    /// Adapter invocations in flight per host.
    pub traverse_adapter_concurrency: usize,
    /// Hard wall-clock bound per adapter invocation.
    pub per_adapter_timeout: Duration,

    pub verbose: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            icmp_concurrency: 254,
            icmp_timeout: Duration::from_millis(1000),
            icmp_retries: 1,
            tcp_scanner_path: PathBuf::from("tools/portscan-tcp"),
            tcp_scanner_concurrency: 200,
            tcp_ports_resource: PathBuf::from("resources/tcp_ports.csv"),
            udp_scanner_path: PathBuf::from("tools/portscan-udp"),
            udp_host_concurrency: 10,
            udp_port_concurrency: 100,
            udp_timeout: Duration::from_millis(3000),
            udp_retries: 1,
            udp_extra_concurrency: 100,
            udp_extra_timeout: Duration::from_millis(3000),
            traverse_host_concurrency: 3,
            traverse_adapter_concurrency: 5,
            per_adapter_timeout: Duration::from_secs(20),
            verbose: false,
        }
    }
}
