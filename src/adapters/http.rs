//! HTTP banner probe: minimal GET over a raw socket, header capture, title
//! extraction, and TLS peer-certificate fields on the HTTPS ports. Consults
//! the device registry before touching port 9100.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use super::util::{tcp_connect, tcp_exchange_capped};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

const BODY_CAP: usize = 10 * 1024;
const TLS_PORTS: &[u16] = &[443, 8443];

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
}

#[derive(Debug, Default)]
pub struct HttpResponse {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub server: Option<String>,
    pub content_type: Option<String>,
    pub www_authenticate: Option<String>,
    pub powered_by: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
}

pub fn parse_response(raw: &[u8]) -> HttpResponse {
    let text = String::from_utf8_lossy(raw);
    let mut response = HttpResponse::default();

    let mut lines = text.lines();
    if let Some(status_line) = lines.next() {
        let mut parts = status_line.splitn(3, ' ');
        if parts.next().is_some_and(|v| v.starts_with("HTTP/")) {
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
        match name.to_ascii_lowercase().as_str() {
            "server" => response.server = Some(value),
            "content-type" => response.content_type = Some(value),
            "www-authenticate" => response.www_authenticate = Some(value),
            "x-powered-by" => response.powered_by = Some(value),
            "location" => response.location = Some(value),
            _ => {}
        }
    }

    if response
        .content_type
        .as_deref()
        .is_none_or(|ct| ct.contains("html"))
    {
        response.title = TITLE_RE
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty());
    }

    response
}

fn request_bytes(host: Ipv4Addr, port: u16) -> Vec<u8> {
    format!(
        "GET / HTTP/1.0\r\nHost: {host}:{port}\r\nUser-Agent: hostscout/0.3\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

#[derive(Debug, Default)]
pub struct TlsCertInfo {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub alt_names: Vec<String>,
}

pub fn parse_certificate(der: &[u8]) -> Result<TlsCertInfo> {
    let (_, cert) = X509Certificate::from_der(der)?;
    let mut info = TlsCertInfo {
        subject: Some(cert.subject().to_string()).filter(|s| !s.is_empty()),
        issuer: Some(cert.issuer().to_string()).filter(|s| !s.is_empty()),
        not_before: Some(cert.validity().not_before.to_string()),
        not_after: Some(cert.validity().not_after.to_string()),
        alt_names: Vec::new(),
    };
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => info.alt_names.push((*dns).to_string()),
                GeneralName::IPAddress(ip) if ip.len() == 4 => {
                    info.alt_names
                        .push(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]).to_string());
                }
                _ => {}
            }
        }
    }
    Ok(info)
}

struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// TLS exchange over a blocking socket: handshake, GET, capped read, peer
/// certificate capture. Runs inside `spawn_blocking`.
fn tls_fetch_blocking(
    host: Ipv4Addr,
    port: u16,
    budget: Duration,
) -> Result<(Vec<u8>, Option<TlsCertInfo>)> {
    use std::io::{Read, Write};

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let server_name = rustls::ServerName::IpAddress(IpAddr::V4(host));
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)?;

    let addr = SocketAddr::from((host, port));
    let mut sock = std::net::TcpStream::connect_timeout(&addr, budget)?;
    sock.set_read_timeout(Some(budget))?;
    sock.set_write_timeout(Some(budget))?;

    let mut tls = rustls::Stream::new(&mut conn, &mut sock);
    tls.write_all(&request_bytes(host, port))?;

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while collected.len() < BODY_CAP {
        match tls.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let room = BODY_CAP - collected.len();
                collected.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(_) => break,
        }
    }

    let cert_info = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| parse_certificate(&cert.0).ok());

    Ok((collected, cert_info))
}

async fn plain_fetch(host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Result<Vec<u8>> {
    let mut stream = tcp_connect(host, port, options.slice(0.4)).await?;
    tcp_exchange_capped(
        &mut stream,
        &request_bytes(host, port),
        BODY_CAP,
        options.remaining(),
    )
    .await
}

#[derive(Default)]
pub struct HttpAdapter;

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["http", "https", "http-alt", "https-alt", "http-dev", "upnp-http"]
    }

    fn default_port(&self) -> u16 {
        80
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        if port == 9100 && registry::should_skip_port_9100(host) {
            tracing::debug!("http probe skipping {}:9100, host classified as printer", host);
            return Vec::new();
        }

        let tls = TLS_PORTS.contains(&port);
        let fetched = if tls {
            let budget = options.remaining().max(Duration::from_millis(100));
            tokio::time::timeout(
                options.remaining(),
                tokio::task::spawn_blocking(move || tls_fetch_blocking(host, port, budget)),
            )
            .await
            .map_err(|_| anyhow!("tls exchange timed out"))
            .and_then(|join| join.map_err(Into::into))
            .and_then(|r| r)
        } else {
            plain_fetch(host, port, options).await.map(|raw| (raw, None))
        };

        let (raw, cert) = match fetched {
            Ok(result) => result,
            Err(e) => {
                tracing::trace!("http probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };
        if raw.is_empty() {
            return Vec::new();
        }

        let response = parse_response(&raw);
        let mut metric = Metric::new("http")
            .tag("port", &port.to_string())
            .tag("scheme", if tls { "https" } else { "http" })
            .field_opt("status", response.status.map(|s| s as i64))
            .field_opt("reason", response.reason.as_deref())
            .field_opt("server", response.server.as_deref())
            .field_opt("content_type", response.content_type.as_deref())
            .field_opt("www_authenticate", response.www_authenticate.as_deref())
            .field_opt("powered_by", response.powered_by.as_deref())
            .field_opt("location", response.location.as_deref())
            .field_opt("title", response.title.as_deref());

        if let Some(cert) = cert {
            metric = metric
                .field_opt("tls_subject", cert.subject.as_deref())
                .field_opt("tls_issuer", cert.issuer.as_deref())
                .field_opt("tls_not_before", cert.not_before.as_deref())
                .field_opt("tls_not_after", cert.not_after.as_deref());
            if !cert.alt_names.is_empty() {
                metric = metric.field("tls_alt_names", cert.alt_names.join(","));
            }
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<HttpAdapter>));
