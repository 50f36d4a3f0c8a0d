//! WinRM fingerprinting through an unauthenticated NTLM negotiation: POST an
//! empty Negotiate to /wsman, decode the Type 2 challenge the server hands
//! back, and read computer/domain names and the OS version out of it.

use std::net::Ipv4Addr;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::util::{ByteReader, tcp_connect, tcp_exchange_capped};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

const NTLMSSP_MAGIC: &[u8] = b"NTLMSSP\0";
const NEGOTIATE_FLAGS: u32 = 0x0200_8207;
const RESPONSE_CAP: usize = 16 * 1024;

/// Minimal NTLM Type 1 (NEGOTIATE) message with empty domain/workstation.
pub fn build_type1() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(NTLMSSP_MAGIC);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    // Domain and workstation: empty, offset past the fixed part
    for _ in 0..2 {
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&32u32.to_le_bytes());
    }
    msg
}

#[derive(Debug, Default, PartialEq)]
pub struct NtlmChallenge {
    pub target_name: Option<String>,
    pub netbios_computer: Option<String>,
    pub netbios_domain: Option<String>,
    pub dns_computer: Option<String>,
    pub dns_domain: Option<String>,
    pub dns_tree: Option<String>,
    pub os_major: Option<u8>,
    pub os_minor: Option<u8>,
    pub os_build: Option<u16>,
}

fn utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decode an NTLM Type 2 (CHALLENGE) message.
pub fn parse_type2(data: &[u8]) -> Result<NtlmChallenge> {
    if data.len() < 32 || &data[..8] != NTLMSSP_MAGIC {
        bail!("not an NTLMSSP message");
    }
    let mut reader = ByteReader::new(data);
    reader.skip(8)?;
    let msg_type = reader.u32_le()?;
    if msg_type != 2 {
        bail!("NTLMSSP message type {} is not a challenge", msg_type);
    }

    let target_len = reader.u16_le()? as usize;
    let _target_max = reader.u16_le()?;
    let target_offset = reader.u32_le()? as usize;
    let flags = reader.u32_le()?;
    reader.skip(8)?; // server challenge
    reader.skip(8)?; // reserved
    let info_len = reader.u16_le()? as usize;
    let _info_max = reader.u16_le()?;
    let info_offset = reader.u32_le()? as usize;

    let mut challenge = NtlmChallenge::default();

    if target_len > 0 && target_offset + target_len <= data.len() {
        challenge.target_name = Some(utf16le(&data[target_offset..target_offset + target_len]));
    }

    // Version block follows the fixed part when the server negotiated it.
    if flags & 0x0200_0000 != 0 && data.len() >= 56 {
        challenge.os_major = Some(data[48]);
        challenge.os_minor = Some(data[49]);
        challenge.os_build = Some(u16::from_le_bytes([data[50], data[51]]));
    }

    if info_len > 0 && info_offset + info_len <= data.len() {
        let mut av = ByteReader::new(&data[info_offset..info_offset + info_len]);
        while av.remaining() >= 4 {
            let av_id = av.u16_le()?;
            let av_len = av.u16_le()? as usize;
            if av_id == 0 {
                break;
            }
            let value = av.take(av_len.min(av.remaining()))?;
            let text = utf16le(value);
            match av_id {
                1 => challenge.netbios_computer = Some(text),
                2 => challenge.netbios_domain = Some(text),
                3 => challenge.dns_computer = Some(text),
                4 => challenge.dns_domain = Some(text),
                5 => challenge.dns_tree = Some(text),
                _ => {}
            }
        }
    }

    Ok(challenge)
}

fn extract_negotiate_token(response: &str) -> Result<Vec<u8>> {
    let header = response
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("www-authenticate:"))
        .ok_or_else(|| anyhow!("no WWW-Authenticate header in response"))?;
    let token = header
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| anyhow!("Negotiate header carries no token"))?;
    Ok(BASE64.decode(token.trim())?)
}

async fn negotiate(host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Result<NtlmChallenge> {
    let token = BASE64.encode(build_type1());
    let request = format!(
        "POST /wsman HTTP/1.1\r\nHost: {host}:{port}\r\n\
         Authorization: Negotiate {token}\r\n\
         Content-Type: application/soap+xml;charset=UTF-8\r\n\
         User-Agent: hostscout/0.3\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );

    let mut stream = tcp_connect(host, port, options.slice(0.4)).await?;
    let raw = tcp_exchange_capped(
        &mut stream,
        request.as_bytes(),
        RESPONSE_CAP,
        options.remaining(),
    )
    .await?;

    let text = String::from_utf8_lossy(&raw);
    let challenge_bytes = extract_negotiate_token(&text)?;
    parse_type2(&challenge_bytes)
}

#[derive(Default)]
pub struct WinrmAdapter;

#[async_trait]
impl Adapter for WinrmAdapter {
    fn name(&self) -> &'static str {
        "winrm"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["winrm"]
    }

    fn default_port(&self) -> u16 {
        5985
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let challenge = match negotiate(host, port, options).await {
            Ok(c) => c,
            Err(e) => {
                tracing::trace!("winrm probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let os_version = match (challenge.os_major, challenge.os_minor, challenge.os_build) {
            (Some(major), Some(minor), Some(build)) => Some(format!("{major}.{minor}.{build}")),
            _ => None,
        };

        vec![
            Metric::new("winrm")
                .tag("port", &port.to_string())
                .field_opt("target_name", challenge.target_name.as_deref())
                .field_opt("netbios_computer", challenge.netbios_computer.as_deref())
                .field_opt("netbios_domain", challenge.netbios_domain.as_deref())
                .field_opt("dns_computer", challenge.dns_computer.as_deref())
                .field_opt("dns_domain", challenge.dns_domain.as_deref())
                .field_opt("dns_tree", challenge.dns_tree.as_deref())
                .field_opt("os_version", os_version.as_deref())
                .field_opt("os_build", challenge.os_build.map(|b| b as i64)),
        ]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<WinrmAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16_bytes(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn build_type2_fixture() -> Vec<u8> {
        let target = utf16_bytes("WORKGROUP");
        let mut info = Vec::new();
        for (id, value) in [
            (1u16, "FILESRV01"),
            (2, "WORKGROUP"),
            (3, "filesrv01.corp.example.com"),
            (4, "corp.example.com"),
            (5, "example.com"),
        ] {
            let bytes = utf16_bytes(value);
            info.extend_from_slice(&id.to_le_bytes());
            info.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            info.extend_from_slice(&bytes);
        }
        info.extend_from_slice(&[0, 0, 0, 0]); // MsvAvEOL

        let target_offset = 56u32;
        let info_offset = target_offset + target.len() as u32;

        let mut msg = Vec::new();
        msg.extend_from_slice(NTLMSSP_MAGIC);
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(&(target.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(target.len() as u16).to_le_bytes());
        msg.extend_from_slice(&target_offset.to_le_bytes());
        msg.extend_from_slice(&0x0281_8215u32.to_le_bytes()); // includes version flag
        msg.extend_from_slice(&[0x11; 8]); // challenge
        msg.extend_from_slice(&[0u8; 8]); // reserved
        msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&info_offset.to_le_bytes());
        // Version: 10.0.20348
        msg.push(10);
        msg.push(0);
        msg.extend_from_slice(&20348u16.to_le_bytes());
        msg.extend_from_slice(&[0, 0, 0, 15]);
        msg.extend_from_slice(&target);
        msg.extend_from_slice(&info);
        msg
    }

    #[test]
    fn type1_shape() {
        let msg = build_type1();
        assert_eq!(msg.len(), 32);
        assert_eq!(&msg[..8], NTLMSSP_MAGIC);
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
    }

    #[test]
    fn type2_decodes_names_and_version() {
        let challenge = parse_type2(&build_type2_fixture()).unwrap();
        assert_eq!(challenge.target_name.as_deref(), Some("WORKGROUP"));
        assert_eq!(challenge.netbios_computer.as_deref(), Some("FILESRV01"));
        assert_eq!(challenge.netbios_domain.as_deref(), Some("WORKGROUP"));
        assert_eq!(
            challenge.dns_computer.as_deref(),
            Some("filesrv01.corp.example.com")
        );
        assert_eq!(challenge.dns_domain.as_deref(), Some("corp.example.com"));
        assert_eq!(challenge.dns_tree.as_deref(), Some("example.com"));
        assert_eq!(challenge.os_major, Some(10));
        assert_eq!(challenge.os_build, Some(20348));
    }

    #[test]
    fn rejects_non_ntlm_payload() {
        assert!(parse_type2(b"definitely not ntlm data here").is_err());
        // Type 1 is not a challenge
        assert!(parse_type2(&build_type1()).is_err());
    }

    #[test]
    fn negotiate_header_token_extraction() {
        let token = BASE64.encode(build_type2_fixture());
        let response = format!(
            "HTTP/1.1 401 Unauthorized\r\nServer: Microsoft-HTTPAPI/2.0\r\nWWW-Authenticate: Negotiate {token}\r\n\r\n"
        );
        let decoded = extract_negotiate_token(&response).unwrap();
        let challenge = parse_type2(&decoded).unwrap();
        assert_eq!(challenge.os_build, Some(20348));
    }

    #[tokio::test]
    async fn probe_against_local_fixture() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]);
            assert!(request.starts_with("POST /wsman"));
            assert!(request.contains("Authorization: Negotiate "));
            let token = BASE64.encode(build_type2_fixture());
            let response = format!(
                "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Negotiate {token}\r\nContent-Length: 0\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let options = ProbeOptions::with_timeout(std::time::Duration::from_secs(2));
        let metrics = WinrmAdapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["os_version"], "10.0.20348");
        assert_eq!(metrics[0].fields["os_build"], 20348);
    }
}
