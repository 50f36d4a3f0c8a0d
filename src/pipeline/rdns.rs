//! Reverse-DNS stage. Private-range hosts that expose their own DNS server
//! are skipped (asking a device about itself mid-scan is useless and slow);
//! everything else gets a system PTR lookup.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::timeout;

use crate::pipeline::aggregator::{Aggregator, Transport};

const LOOKUP_TIMEOUT: Duration = Duration::from_millis(800);
const LOOKUP_CONCURRENCY: usize = 16;

/// RFC 1918, loopback and link-local.
pub fn is_private(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
        || octets[0] == 127
        || (octets[0] == 169 && octets[1] == 254)
}

pub fn should_skip(ip: Ipv4Addr, has_tcp_53: bool) -> bool {
    is_private(ip) && has_tcp_53
}

async fn lookup_ptr(ip: Ipv4Addr) -> Option<String> {
    let addr = IpAddr::V4(ip);
    match timeout(LOOKUP_TIMEOUT, async {
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr)).await
    })
    .await
    {
        Ok(Ok(Ok(hostname))) => Some(hostname).filter(|h| h != &ip.to_string()),
        _ => None,
    }
}

/// Resolve hostnames for every host currently in the map.
pub async fn resolve_all(aggregator: &Aggregator) {
    let snapshot = aggregator.snapshot().await;
    let candidates: Vec<Ipv4Addr> = snapshot
        .iter()
        .filter(|(ip, record)| {
            if should_skip(**ip, record.ports.has(Transport::Tcp, 53)) {
                tracing::debug!("rdns skipping {}, host serves DNS itself", ip);
                false
            } else {
                true
            }
        })
        .map(|(ip, _)| *ip)
        .collect();

    let resolved: Vec<(Ipv4Addr, String)> = stream::iter(candidates)
        .map(|ip| async move { lookup_ptr(ip).await.map(|name| (ip, name)) })
        .buffer_unordered(LOOKUP_CONCURRENCY)
        .filter_map(|result| async move { result })
        .collect()
        .await;

    for (ip, hostname) in resolved {
        tracing::debug!("rdns {} -> {}", ip, hostname);
        aggregator.set_hostname(ip, hostname).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges() {
        assert!(is_private(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(is_private(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private(Ipv4Addr::new(172, 31, 255, 1)));
        assert!(is_private(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(is_private(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_private(Ipv4Addr::new(169, 254, 9, 9)));

        assert!(!is_private(Ipv4Addr::new(172, 15, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_private(Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn skip_requires_both_conditions() {
        // Private with its own DNS server: skipped
        assert!(should_skip(Ipv4Addr::new(192, 168, 1, 1), true));
        // Private without DNS: looked up
        assert!(!should_skip(Ipv4Addr::new(192, 168, 1, 50), false));
        // Public with DNS open: looked up
        assert!(!should_skip(Ipv4Addr::new(8, 8, 8, 8), true));
    }
}
