//! hostscout: agentless discovery of IP-connected devices on a subnet and
//! classification of the services they expose. One run sweeps a /24 with
//! ICMP/TCP/UDP probes, reclassifies ambiguous ports, resolves hostnames,
//! then speaks each discovered protocol to the device through a fixed set
//! of adapters, emitting a single JSON document.

pub mod adapters;
pub mod config;
pub mod error;
pub mod lookup;
pub mod output;
pub mod pipeline;
pub mod privilege;
pub mod registry;
pub mod scan;
