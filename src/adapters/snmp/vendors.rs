//! Enterprise-number vendor table and the vendor-specific OID prefixes worth
//! walking once a vendor is recognised. Matching is longest-prefix over the
//! sysObjectID.

pub struct VendorEntry {
    pub prefix: &'static str,
    pub vendor: &'static str,
    /// Additional subtrees that flesh out identification for this vendor.
    pub walk_prefixes: &'static [&'static str],
}

pub const ENTERPRISE_VENDORS: &[VendorEntry] = &[
    VendorEntry { prefix: "1.3.6.1.4.1.2", vendor: "IBM", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.9", vendor: "Cisco", walk_prefixes: &["1.3.6.1.4.1.9.2.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.9.1", vendor: "Cisco", walk_prefixes: &["1.3.6.1.4.1.9.2.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.11", vendor: "HP", walk_prefixes: &["1.3.6.1.4.1.11.2.3.9.4.2.1.1.3"] },
    VendorEntry { prefix: "1.3.6.1.4.1.42", vendor: "Oracle", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.43", vendor: "3Com", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.63", vendor: "Apple", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.119", vendor: "NEC", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.171", vendor: "D-Link", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.207", vendor: "Allied Telesis", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.253", vendor: "Xerox", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.297", vendor: "Fuji Xerox", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.311", vendor: "Microsoft", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.318", vendor: "APC", walk_prefixes: &["1.3.6.1.4.1.318.1.1.1.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.367", vendor: "Ricoh", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.641", vendor: "Lexmark", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.674", vendor: "Dell", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.789", vendor: "NetApp", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.1248", vendor: "Epson", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.1347", vendor: "Kyocera", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.1588", vendor: "Brocade", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.1602", vendor: "Canon", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.1991", vendor: "Foundry", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.2011", vendor: "Huawei", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.2435", vendor: "Brother", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.2636", vendor: "Juniper", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.3808", vendor: "CyberPower", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.4526", vendor: "Netgear", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.6027", vendor: "Force10", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.6574", vendor: "Synology", walk_prefixes: &["1.3.6.1.4.1.6574.1.5"] },
    VendorEntry { prefix: "1.3.6.1.4.1.8072", vendor: "net-snmp", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.11863", vendor: "TP-Link", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.12356", vendor: "Fortinet", walk_prefixes: &["1.3.6.1.4.1.12356.101.4.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.14823", vendor: "Aruba", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.14988", vendor: "MikroTik", walk_prefixes: &["1.3.6.1.4.1.14988.1.1.4"] },
    VendorEntry { prefix: "1.3.6.1.4.1.18334", vendor: "Konica Minolta", walk_prefixes: &["1.3.6.1.2.1.43.5.1.1"] },
    VendorEntry { prefix: "1.3.6.1.4.1.24681", vendor: "QNAP", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.25506", vendor: "H3C", walk_prefixes: &[] },
    VendorEntry { prefix: "1.3.6.1.4.1.41112", vendor: "Ubiquiti", walk_prefixes: &[] },
];

fn is_prefix_of(prefix: &str, oid: &str) -> bool {
    oid == prefix || oid.starts_with(&format!("{prefix}."))
}

/// Longest-prefix vendor match for a sysObjectID.
pub fn vendor_for(sys_object_id: &str) -> Option<&'static VendorEntry> {
    ENTERPRISE_VENDORS
        .iter()
        .filter(|entry| is_prefix_of(entry.prefix, sys_object_id))
        .max_by_key(|entry| entry.prefix.len())
}

/// Drop any prefix that sits inside another prefix in the list.
pub fn collapse_prefixes(prefixes: &[&'static str]) -> Vec<&'static str> {
    let mut collapsed: Vec<&'static str> = Vec::new();
    for candidate in prefixes {
        if prefixes
            .iter()
            .any(|other| *other != *candidate && is_prefix_of(other, candidate))
        {
            continue;
        }
        if !collapsed.contains(candidate) {
            collapsed.push(candidate);
        }
    }
    collapsed
}
