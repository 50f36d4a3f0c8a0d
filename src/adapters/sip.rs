//! SIP OPTIONS probe over UDP. One randomised request, first response wins.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use rand::Rng;

use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

/// Send on an already-bound socket (the request embeds its local port) and
/// wait for the first datagram from the target.
async fn exchange_on(
    socket: &tokio::net::UdpSocket,
    target: SocketAddr,
    payload: &[u8],
    wait: std::time::Duration,
) -> anyhow::Result<Option<Vec<u8>>> {
    socket.send_to(payload, target).await?;
    let mut buf = vec![0u8; 65536];
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        match tokio::time::timeout(deadline - now, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from.ip() != target.ip() {
                    continue;
                }
                return Ok(Some(buf[..len].to_vec()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(None),
        }
    }
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn build_options_request(target: Ipv4Addr, port: u16, local_addr: SocketAddr) -> String {
    let branch = format!("z9hG4bK{}", random_token(12));
    let from_tag = random_token(10);
    let call_id = format!("{}@{}", random_token(16), local_addr.ip());

    format!(
        "OPTIONS sip:{target}:{port} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local_addr};branch={branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:probe@{local}>;tag={from_tag}\r\n\
         To: <sip:{target}:{port}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Contact: <sip:probe@{local_addr}>\r\n\
         Accept: application/sdp\r\n\
         Content-Length: 0\r\n\r\n",
        local = local_addr.ip(),
    )
}

#[derive(Debug, Default, PartialEq)]
pub struct SipResponse {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub user_agent: Option<String>,
    pub server: Option<String>,
    pub allow: Option<String>,
    pub supported: Option<String>,
}

pub fn parse_response(raw: &str) -> SipResponse {
    let mut response = SipResponse::default();
    let mut lines = raw.lines();

    if let Some(status_line) = lines.next() {
        let mut parts = status_line.splitn(3, ' ');
        if parts.next().is_some_and(|v| v.starts_with("SIP/")) {
            response.status = parts.next().and_then(|s| s.parse().ok());
            response.reason = parts.next().map(str::to_string);
        }
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "user-agent" => response.user_agent = Some(value),
            "server" => response.server = Some(value),
            "allow" => response.allow = Some(value),
            "supported" => response.supported = Some(value),
            _ => {}
        }
    }

    response
}

#[derive(Default)]
pub struct SipAdapter;

#[async_trait]
impl Adapter for SipAdapter {
    fn name(&self) -> &'static str {
        "sip"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["sip"]
    }

    fn default_port(&self) -> u16 {
        5060
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let target = SocketAddr::from((host, port));
        // Bind first so the Via/Contact headers carry the real local port.
        let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                tracing::trace!("sip probe {}:{} - bind failed: {}", host, port, e);
                return Vec::new();
            }
        };
        let local_addr = socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let request = build_options_request(host, port, local_addr);

        let raw = match exchange_on(&socket, target, request.as_bytes(), options.remaining()).await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::trace!("sip probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let response = parse_response(&String::from_utf8_lossy(&raw));
        if response.status.is_none() {
            return Vec::new();
        }

        vec![
            Metric::new("sip")
                .tag("port", &port.to_string())
                .field_opt("status", response.status.map(|s| s as i64))
                .field_opt("reason", response.reason.as_deref())
                .field_opt("user_agent", response.user_agent.as_deref())
                .field_opt("server", response.server.as_deref())
                .field_opt("allow", response.allow.as_deref())
                .field_opt("supported", response.supported.as_deref()),
        ]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<SipAdapter>));
