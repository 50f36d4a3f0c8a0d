//! SSH identification-banner probe. Reads the server's identification line,
//! pulls out protocol and software versions, and recognises the OS
//! distribution tokens vendors embed in the comment field.

use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::util::tcp_connect;
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

const CLIENT_IDENT: &[u8] = b"SSH-2.0-hostscout_0.3\r\n";
const BANNER_CAP: usize = 512;

lazy_static! {
    static ref BANNER_RE: Regex =
        Regex::new(r"^SSH-(?P<proto>[0-9.]+)-(?P<software>\S+)(?:\s+(?P<comments>.*))?$").unwrap();
    static ref DEBIAN_PATCH_RE: Regex = Regex::new(r"deb(?P<major>\d+)(?:u\d+)?").unwrap();
}

const DISTRO_TOKENS: &[&str] = &[
    "Ubuntu", "Debian", "CentOS", "RHEL", "Fedora", "SUSE", "Raspbian", "Alpine", "Arch",
];

fn debian_codename(major: u32) -> Option<&'static str> {
    match major {
        9 => Some("Stretch"),
        10 => Some("Buster"),
        11 => Some("Bullseye"),
        12 => Some("Bookworm"),
        13 => Some("Trixie"),
        _ => None,
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SshBanner {
    pub protocol_version: String,
    pub software: String,
    pub software_name: String,
    pub software_version: String,
    pub comments: Option<String>,
    pub distro: Option<String>,
    pub distro_release: Option<String>,
}

pub fn parse_banner(line: &str) -> Option<SshBanner> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = BANNER_RE.captures(line)?;

    let software = caps["software"].to_string();
    let (software_name, software_version) = match software.split_once('_') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => (software.clone(), String::new()),
    };

    let comments = caps.name("comments").map(|m| m.as_str().to_string());

    let haystack = line.to_ascii_lowercase();
    let distro = DISTRO_TOKENS
        .iter()
        .find(|t| haystack.contains(&t.to_ascii_lowercase()))
        .map(|t| t.to_string());

    let distro_release = DEBIAN_PATCH_RE
        .captures(line)
        .and_then(|c| c["major"].parse::<u32>().ok())
        .and_then(debian_codename)
        .map(str::to_string);

    Some(SshBanner {
        protocol_version: caps["proto"].to_string(),
        software,
        software_name,
        software_version,
        comments,
        distro,
        distro_release,
    })
}

async fn read_banner(host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Result<String> {
    let mut stream = tcp_connect(host, port, options.slice(0.5)).await?;
    stream.write_all(CLIENT_IDENT).await?;

    let mut collected = Vec::new();
    let mut buf = [0u8; 128];
    let deadline = options.deadline;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline || collected.len() >= BANNER_CAP {
            break;
        }
        match timeout(deadline - now, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                collected.extend_from_slice(&buf[..n]);
                if collected.contains(&b'\n') {
                    break;
                }
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    // Servers may send pre-banner text lines; the identification line is the
    // first one starting with SSH-.
    let text = String::from_utf8_lossy(&collected);
    text.lines()
        .find(|l| l.starts_with("SSH-"))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no SSH identification line from {}:{}", host, port))
}

#[derive(Default)]
pub struct SshAdapter;

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["ssh"]
    }

    fn default_port(&self) -> u16 {
        22
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let line = match read_banner(host, port, options).await {
            Ok(line) => line,
            Err(e) => {
                tracing::trace!("ssh probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };
        let Some(banner) = parse_banner(&line) else {
            return Vec::new();
        };

        let metric = Metric::new("ssh")
            .tag("port", &port.to_string())
            .field("banner", line.trim_end_matches(['\r', '\n']))
            .field("protocol_version", banner.protocol_version.as_str())
            .field("software", banner.software.as_str())
            .field("software_name", banner.software_name.as_str())
            .field_opt(
                "software_version",
                (!banner.software_version.is_empty()).then_some(banner.software_version.as_str()),
            )
            .field_opt("comments", banner.comments.as_deref())
            .field_opt("os_distribution", banner.distro.as_deref())
            .field_opt("os_release", banner.distro_release.as_deref());

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<SshAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openssh_ubuntu_banner() {
        let banner = parse_banner("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6\r\n").unwrap();
        assert_eq!(banner.protocol_version, "2.0");
        assert_eq!(banner.software_name, "OpenSSH");
        assert_eq!(banner.software_version, "8.9p1");
        assert_eq!(banner.distro.as_deref(), Some("Ubuntu"));
        assert_eq!(banner.distro_release, None);
    }

    #[test]
    fn debian_patch_level_maps_to_codename() {
        let banner = parse_banner("SSH-2.0-OpenSSH_9.2p1 Debian-2+deb12u3").unwrap();
        assert_eq!(banner.distro.as_deref(), Some("Debian"));
        assert_eq!(banner.distro_release.as_deref(), Some("Bookworm"));

        let banner = parse_banner("SSH-2.0-OpenSSH_7.4p1 Debian-10+deb9u7").unwrap();
        assert_eq!(banner.distro_release.as_deref(), Some("Stretch"));
    }

    #[test]
    fn dropbear_banner_without_comments() {
        let banner = parse_banner("SSH-2.0-dropbear_2020.81").unwrap();
        assert_eq!(banner.software_name, "dropbear");
        assert_eq!(banner.software_version, "2020.81");
        assert!(banner.distro.is_none());
        assert!(banner.comments.is_none());
    }

    #[test]
    fn raspbian_token_detected() {
        let banner = parse_banner("SSH-2.0-OpenSSH_7.9p1 Raspbian-10+deb10u2").unwrap();
        assert_eq!(banner.distro.as_deref(), Some("Raspbian"));
        assert_eq!(banner.distro_release.as_deref(), Some("Buster"));
    }

    #[test]
    fn non_ssh_line_rejected() {
        assert!(parse_banner("220 ftp ready").is_none());
    }

    #[tokio::test]
    async fn probe_against_local_fixture() {
        use tokio::io::AsyncWriteExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"SSH-2.0-OpenSSH_8.4p1 Debian-5+deb11u1\r\n")
                .await
                .unwrap();
        });

        let options = ProbeOptions::with_timeout(std::time::Duration::from_secs(2));
        let metrics = SshAdapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["os_release"], "Bullseye");
    }
}
