//! BACnet vendor identifiers (ASHRAE registry, common subset).

pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    let name = match vendor_id {
        0 => "ASHRAE",
        1 => "NIST",
        2 => "The Trane Company",
        5 => "Johnson Controls",
        8 => "Delta Controls",
        10 => "Schneider Electric",
        17 => "Honeywell",
        18 => "Alerton",
        24 => "Automated Logic",
        26 => "McQuay International",
        36 => "Tridium",
        85 => "Reliable Controls",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_ids() {
        assert_eq!(vendor_name(5), Some("Johnson Controls"));
        assert_eq!(vendor_name(36), Some("Tridium"));
        assert_eq!(vendor_name(64999), None);
    }
}
