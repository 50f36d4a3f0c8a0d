//! The sweep stage: range expansion, the constant-parallelism batcher, the
//! native ICMP and UDP-extra probes, and the external TCP/UDP scanner
//! adapters.

pub mod batch;
pub mod icmp;
pub mod orchestrator;
pub mod range;
pub mod tcp;
pub mod udp;
pub mod udp_extra;
