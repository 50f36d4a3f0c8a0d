//! Cross-signal reclassification over the aggregated host map. Each rule is
//! an independent predicate; rules commute and the whole pass is idempotent.

use crate::pipeline::aggregator::{HostMap, HostRecord, Transport};

type Rule = fn(&mut HostRecord);

const RULES: &[Rule] = &[reclassify_raw_print_port, reclassify_chromecast_pair];

/// A TCP 9100 labelled `prometheus` on a host that also speaks LPD, IPP or
/// WS-Discovery is a raw printer port, not a metrics exporter.
fn reclassify_raw_print_port(record: &mut HostRecord) {
    let printing_signals = record.ports.label(Transport::Tcp, 515) == Some("lpd")
        || record.ports.label(Transport::Tcp, 631) == Some("ipp")
        || record.ports.label(Transport::Udp, 3702) == Some("wsd");
    if !printing_signals {
        return;
    }
    if let Some(label) = record.ports.tcp.get_mut(&9100) {
        if label.as_deref() == Some("prometheus") {
            *label = Some("pdl".to_string());
        }
    }
}

/// The 8008+8009 pair is the cast stack; 8008 alone is any HTTP alt port.
fn reclassify_chromecast_pair(record: &mut HostRecord) {
    if !record.ports.has(Transport::Tcp, 8009) {
        return;
    }
    if let Some(label) = record.ports.tcp.get_mut(&8008) {
        if label.as_deref() == Some("http-alt") {
            *label = Some("chromecast".to_string());
        }
    }
}

/// Single pass over the host map.
pub fn apply(hosts: &mut HostMap) {
    for record in hosts.values_mut() {
        for rule in RULES {
            rule(record);
        }
    }
}
