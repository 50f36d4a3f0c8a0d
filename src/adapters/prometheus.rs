//! Prometheus exposition scrape: GET /metrics with a capped body, parse the
//! text format into families and samples. Port 9100 is shared with raw
//! printing, so the device registry is consulted first.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;

use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};
use crate::registry;

const BODY_CAP: usize = 100 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Default)]
pub struct Exposition {
    pub help: BTreeMap<String, String>,
    pub types: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if !key.is_empty() {
            labels.insert(key.to_string(), value.to_string());
        }
    }
    labels
}

pub fn parse_exposition(text: &str) -> Exposition {
    let mut exposition = Exposition::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# HELP ") {
            if let Some((family, help)) = rest.split_once(' ') {
                exposition.help.insert(family.to_string(), help.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            if let Some((family, kind)) = rest.split_once(' ') {
                exposition.types.insert(family.to_string(), kind.to_string());
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let (name_part, value_part) = match line.find('{') {
            Some(open) => {
                let Some(close) = line.rfind('}') else {
                    continue;
                };
                (
                    (&line[..open], &line[open + 1..close]),
                    line[close + 1..].trim(),
                )
            }
            None => match line.split_once(char::is_whitespace) {
                Some((name, rest)) => ((name, ""), rest.trim()),
                None => continue,
            },
        };

        let mut value_fields = value_part.split_whitespace();
        let Some(value) = value_fields.next().and_then(|v| parse_value(v)) else {
            continue;
        };
        let timestamp = value_fields.next().and_then(|t| t.parse::<i64>().ok());

        exposition.samples.push(Sample {
            name: name_part.0.trim().to_string(),
            labels: parse_labels(name_part.1),
            value,
            timestamp,
        });
    }

    exposition
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

async fn scrape(host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(options.remaining())
        .danger_accept_invalid_certs(true)
        .build()?;

    let url = format!("http://{host}:{port}/metrics");
    let mut response = client
        .get(&url)
        .header("Accept", "text/plain")
        .send()
        .await?;
    if !response.status().is_success() {
        anyhow::bail!("{} returned {}", url, response.status());
    }

    let mut collected: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = BODY_CAP.saturating_sub(collected.len());
        if room == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(String::from_utf8_lossy(&collected).to_string())
}

#[derive(Default)]
pub struct PrometheusAdapter;

#[async_trait]
impl Adapter for PrometheusAdapter {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["prometheus"]
    }

    fn default_port(&self) -> u16 {
        9090
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        if port == 9100 && registry::should_skip_port_9100(host) {
            tracing::debug!(
                "prometheus probe skipping {}:9100, host classified as printer",
                host
            );
            return Vec::new();
        }

        let body = match scrape(host, port, options).await {
            Ok(body) => body,
            Err(e) => {
                tracing::trace!("prometheus probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let exposition = parse_exposition(&body);
        if exposition.samples.is_empty() {
            return Vec::new();
        }

        let families: std::collections::BTreeSet<&str> = exposition
            .samples
            .iter()
            .map(|s| s.name.as_str())
            .collect();

        let mut metric = Metric::new("prometheus")
            .tag("port", &port.to_string())
            .field("families", families.len() as i64)
            .field("samples", exposition.samples.len() as i64)
            .field("typed_families", exposition.types.len() as i64);

        // Exporter build info, when published, identifies the service.
        if let Some(build) = exposition
            .samples
            .iter()
            .find(|s| s.name.ends_with("_build_info"))
        {
            metric = metric
                .field("exporter", build.name.trim_end_matches("_build_info"))
                .field_opt("exporter_version", build.labels.get("version").map(String::as_str))
                .field_opt("exporter_goversion", build.labels.get("goversion").map(String::as_str));
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<PrometheusAdapter>));

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const FIXTURE: &str = r#"
# HELP node_cpu_seconds_total Seconds the CPUs spent in each mode.
# TYPE node_cpu_seconds_total counter
node_cpu_seconds_total{cpu="0",mode="idle"} 312.4 1700000000000
node_cpu_seconds_total{cpu="0",mode="user"} 12.1
# HELP node_exporter_build_info Build info
# TYPE node_exporter_build_info gauge
node_exporter_build_info{version="1.7.0",goversion="go1.21.4"} 1
up 1
"#;

    #[test]
    fn parses_help_type_and_samples() {
        let exposition = parse_exposition(FIXTURE);
        assert_eq!(
            exposition.types.get("node_cpu_seconds_total").map(String::as_str),
            Some("counter")
        );
        assert!(exposition.help.contains_key("node_exporter_build_info"));
        assert_eq!(exposition.samples.len(), 4);

        let first = &exposition.samples[0];
        assert_eq!(first.name, "node_cpu_seconds_total");
        assert_eq!(first.labels["mode"], "idle");
        assert_eq!(first.value, 312.4);
        assert_eq!(first.timestamp, Some(1700000000000));

        let bare = exposition.samples.last().unwrap();
        assert_eq!(bare.name, "up");
        assert!(bare.labels.is_empty());
        assert_eq!(bare.value, 1.0);
    }

    #[test]
    fn special_values_and_garbage() {
        let exposition = parse_exposition("x +Inf\ny NaN\nnot a metric line at all { }\n");
        assert_eq!(exposition.samples.len(), 2);
        assert!(exposition.samples[0].value.is_infinite());
        assert!(exposition.samples[1].value.is_nan());
    }

    #[test]
    fn label_values_with_quotes() {
        let exposition =
            parse_exposition(r#"http_requests_total{method="GET",code="200"} 1027"#);
        assert_eq!(exposition.samples[0].labels["method"], "GET");
        assert_eq!(exposition.samples[0].labels["code"], "200");
    }

    #[tokio::test]
    #[serial]
    async fn port_9100_gated_by_registry() {
        crate::registry::clear();
        let host = Ipv4Addr::new(127, 0, 0, 1);
        crate::registry::mark_printer(host, "snmp", serde_json::Map::new());
        let options = ProbeOptions::with_timeout(std::time::Duration::from_secs(1));
        let metrics = PrometheusAdapter.discover(host, 9100, &options).await;
        assert!(metrics.is_empty());
        crate::registry::clear();
    }

    #[tokio::test]
    #[serial]
    async fn scrape_against_local_fixture() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        crate::registry::clear();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await;
            let body = "up 1\nnode_exporter_build_info{version=\"1.7.0\"} 1\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let options = ProbeOptions::with_timeout(std::time::Duration::from_secs(2));
        let metrics = PrometheusAdapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["samples"], 2);
        assert_eq!(metrics[0].fields["exporter"], "node_exporter");
        assert_eq!(metrics[0].fields["exporter_version"], "1.7.0");
    }
}
