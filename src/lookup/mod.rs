//! Default service labels for well-known ports, plus the fallback chain
//! applied to labels reported by the external UDP scanner.

use crate::pipeline::aggregator::Transport;

/// Default label for a TCP port, if one is known.
pub fn tcp_label(port: u16) -> Option<&'static str> {
    let label = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        81 => "http-alt",
        88 => "kerberos",
        102 => "s7",
        110 => "pop3",
        111 => "rpcbind",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        179 => "bgp",
        389 => "ldap",
        443 => "https",
        445 => "smb",
        465 => "smtps",
        502 => "modbus",
        515 => "lpd",
        548 => "afp",
        554 => "rtsp",
        587 => "submission",
        631 => "ipp",
        636 => "ldaps",
        873 => "rsync",
        993 => "imaps",
        995 => "pop3s",
        1080 => "socks",
        1433 => "mssql",
        1521 => "oracle",
        1723 => "pptp",
        1883 => "mqtt",
        2049 => "nfs",
        2181 => "zookeeper",
        2375 | 2376 => "docker",
        3000 => "http-dev",
        3128 => "http-proxy",
        3260 => "iscsi",
        3306 => "mysql",
        3389 => "rdp",
        4840 => "opcua",
        5000 | 5001 => "upnp-http",
        5060 | 5061 => "sip",
        5432 => "postgres",
        5672 => "amqp",
        5900 | 5901 => "vnc",
        5985 | 5986 => "winrm",
        6379 => "redis",
        6443 => "kube-api",
        7000 => "airplay",
        7547 => "cwmp",
        8000 | 8081 | 8088 | 8888 => "http-alt",
        8008 => "http-alt",
        8009 => "castv2",
        8080 => "http-alt",
        8123 => "home-assistant",
        8443 | 9443 | 4443 | 7443 => "https-alt",
        8883 => "mqtts",
        9090 => "prometheus",
        // Raw-print and node_exporter share 9100; the post-processor
        // corrects this on printer hosts.
        9100 => "prometheus",
        9200 | 9300 => "elasticsearch",
        11211 => "memcached",
        27017 => "mongodb",
        44818 => "enip",
        47808 => "bacnet",
        _ => return None,
    };
    Some(label)
}

/// Default label for a UDP port, if one is known.
pub fn udp_label(port: u16) -> Option<&'static str> {
    let label = match port {
        53 => "dns",
        67 => "dhcp",
        69 => "tftp",
        123 => "ntp",
        137 => "netbios-ns",
        138 => "netbios-dgm",
        161 => "snmp",
        162 => "snmp-trap",
        500 => "isakmp",
        514 => "syslog",
        520 => "rip",
        623 => "ipmi",
        1194 => "openvpn",
        1604 => "citrix",
        1900 => "ssdp",
        3702 => "wsd",
        4840 => "opcua",
        5060 => "sip",
        5353 => "mdns",
        5683 => "coap",
        44818 => "enip",
        47808 => "bacnet",
        _ => return None,
    };
    Some(label)
}

pub fn label_for(transport: Transport, port: u16) -> Option<&'static str> {
    match transport {
        Transport::Tcp => tcp_label(port),
        Transport::Udp => udp_label(port),
    }
}

/// Resolve the label for a UDP scan result: the tool's label wins when it is
/// non-empty and not "unknown", then the table, then "unknown".
pub fn resolve_udp_label(tool_label: Option<&str>, port: u16) -> String {
    match tool_label {
        Some(l) if !l.is_empty() && l != "unknown" => l.to_string(),
        _ => udp_label(port).unwrap_or("unknown").to_string(),
    }
}
