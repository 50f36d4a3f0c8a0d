//! OPC UA server identification over the binary TCP protocol, all with
//! SecurityPolicy None: HEL/ACK, OpenSecureChannel, an anonymous session,
//! then one Read of Server_ServerStatus and Server_ServerArray.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::util::{ByteReader, tcp_connect};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

pub const OPCUA_PORT: u16 = 4840;
const SECURITY_POLICY_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
const NODE_SERVER_STATUS: u16 = 2256;
const NODE_SERVER_ARRAY: u16 = 2254;
const ATTRIBUTE_VALUE: u32 = 13;

// Binary encoding ids of the request/response structures involved.
const ID_OPEN_SECURE_CHANNEL_REQUEST: u16 = 446;
const ID_OPEN_SECURE_CHANNEL_RESPONSE: u16 = 449;
const ID_CREATE_SESSION_REQUEST: u16 = 461;
const ID_CREATE_SESSION_RESPONSE: u16 = 464;
const ID_ACTIVATE_SESSION_REQUEST: u16 = 467;
const ID_ACTIVATE_SESSION_RESPONSE: u16 = 470;
const ID_READ_REQUEST: u16 = 631;
const ID_READ_RESPONSE: u16 = 634;
const ID_ANONYMOUS_IDENTITY_TOKEN: u16 = 321;

/// Offset between the UA epoch (1601) and Unix time, in 100 ns ticks.
const EPOCH_TICKS: i64 = 116_444_736_000_000_000;

fn ua_now() -> i64 {
    let now = Utc::now();
    EPOCH_TICKS + now.timestamp() * 10_000_000 + i64::from(now.timestamp_subsec_nanos() / 100)
}

pub fn ticks_to_datetime(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 {
        return None;
    }
    let unix_ns = (ticks - EPOCH_TICKS).checked_mul(100)?;
    Utc.timestamp_opt(unix_ns.div_euclid(1_000_000_000), (unix_ns.rem_euclid(1_000_000_000)) as u32)
        .single()
}

// --- little-endian writers ---

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(s) => {
            put_i32(out, s.len() as i32);
            out.extend_from_slice(s.as_bytes());
        }
        None => put_i32(out, -1),
    }
}

/// Four-byte numeric NodeId in namespace 0.
fn put_node_id(out: &mut Vec<u8>, id: u16) {
    out.push(0x01);
    out.push(0x00);
    out.extend_from_slice(&id.to_le_bytes());
}

fn put_null_node_id(out: &mut Vec<u8>) {
    out.push(0x00);
    out.push(0x00);
}

/// RequestHeader with the given authentication token bytes (a null NodeId
/// before the session exists).
fn put_request_header(out: &mut Vec<u8>, auth_token: &[u8], handle: u32) {
    out.extend_from_slice(auth_token);
    put_i64(out, ua_now());
    put_u32(out, handle);
    put_u32(out, 0); // return diagnostics
    put_string(out, None); // audit entry id
    put_u32(out, 10_000); // timeout hint
    put_null_node_id(out); // additional header type id
    out.push(0x00); // additional header encoding
}

fn message(kind: &[u8; 3], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(kind);
    out.push(b'F');
    put_u32(&mut out, (body.len() + 8) as u32);
    out.extend_from_slice(body);
    out
}

pub fn hello_message(endpoint: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, 0); // protocol version
    put_u32(&mut body, 65536); // receive buffer
    put_u32(&mut body, 65536); // send buffer
    put_u32(&mut body, 1 << 20); // max message size
    put_u32(&mut body, 16); // max chunk count
    put_string(&mut body, Some(endpoint));
    message(b"HEL", &body)
}

fn open_secure_channel_message(sequence: u32) -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, 0); // secure channel id
    put_string(&mut body, Some(SECURITY_POLICY_NONE));
    put_i32(&mut body, -1); // sender certificate: null
    put_i32(&mut body, -1); // receiver thumbprint: null
    put_u32(&mut body, sequence);
    put_u32(&mut body, sequence); // request id

    put_node_id(&mut body, ID_OPEN_SECURE_CHANNEL_REQUEST);
    let mut auth = Vec::new();
    put_null_node_id(&mut auth);
    put_request_header(&mut body, &auth, 1);
    put_u32(&mut body, 0); // client protocol version
    put_u32(&mut body, 0); // request type: issue
    put_u32(&mut body, 1); // security mode: None
    put_i32(&mut body, -1); // client nonce: null
    put_u32(&mut body, 3_600_000); // requested lifetime
    message(b"OPN", &body)
}

struct Channel {
    channel_id: u32,
    token_id: u32,
    sequence: u32,
}

fn msg_message(channel: &mut Channel, payload: &[u8]) -> Vec<u8> {
    channel.sequence += 1;
    let mut body = Vec::new();
    put_u32(&mut body, channel.channel_id);
    put_u32(&mut body, channel.token_id);
    put_u32(&mut body, channel.sequence);
    put_u32(&mut body, channel.sequence);
    body.extend_from_slice(payload);
    message(b"MSG", &body)
}

// --- little-endian readers ---

fn read_string(reader: &mut ByteReader) -> Result<Option<String>> {
    let len = reader.i32_le()?;
    if len < 0 {
        return Ok(None);
    }
    let raw = reader.take(len as usize)?;
    Ok(Some(String::from_utf8_lossy(raw).to_string()))
}

fn read_bytestring(reader: &mut ByteReader) -> Result<Option<Vec<u8>>> {
    let len = reader.i32_le()?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(reader.take(len as usize)?.to_vec()))
}

/// Read a NodeId, returning its raw encoded bytes (so it can be echoed).
fn read_node_id_raw(reader: &mut ByteReader) -> Result<Vec<u8>> {
    let start = reader.position();
    let encoding = reader.u8()?;
    match encoding & 0x0F {
        0x00 => {
            reader.skip(1)?;
        }
        0x01 => {
            reader.skip(3)?;
        }
        0x02 => {
            reader.skip(2)?;
            reader.skip(4)?;
        }
        0x03 => {
            reader.skip(2)?;
            let len = reader.i32_le()?;
            if len > 0 {
                reader.skip(len as usize)?;
            }
        }
        0x04 => {
            reader.skip(2)?;
            reader.skip(16)?;
        }
        0x05 => {
            reader.skip(2)?;
            let len = reader.i32_le()?;
            if len > 0 {
                reader.skip(len as usize)?;
            }
        }
        other => bail!("unsupported NodeId encoding {:#04x}", other),
    }
    let end = reader.position();
    reader.seek(start)?;
    let raw = reader.take(end - start)?.to_vec();
    Ok(raw)
}

fn node_id_numeric(raw: &[u8]) -> Option<u32> {
    match raw.first()? & 0x0F {
        0x00 => Some(raw.get(1).copied()? as u32),
        0x01 => Some(u16::from_le_bytes([*raw.get(2)?, *raw.get(3)?]) as u32),
        0x02 => Some(u32::from_le_bytes([
            *raw.get(3)?,
            *raw.get(4)?,
            *raw.get(5)?,
            *raw.get(6)?,
        ])),
        _ => None,
    }
}

/// ResponseHeader with empty diagnostics; returns the service result.
fn read_response_header(reader: &mut ByteReader) -> Result<u32> {
    reader.skip(8)?; // timestamp
    reader.skip(4)?; // request handle
    let service_result = reader.u32_le()?;
    let diagnostics_mask = reader.u8()?;
    if diagnostics_mask != 0 {
        bail!("unexpected diagnostic info in response header");
    }
    let string_table_len = reader.i32_le()?;
    for _ in 0..string_table_len.max(0) {
        let _ = read_string(reader)?;
    }
    let _type_id = read_node_id_raw(reader)?;
    let encoding = reader.u8()?;
    if encoding != 0 {
        bail!("unexpected additional header body");
    }
    Ok(service_result)
}

async fn read_frame(stream: &mut TcpStream, step: Duration) -> Result<(String, Vec<u8>)> {
    let mut header = [0u8; 8];
    timeout(step, stream.read_exact(&mut header))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    let kind = String::from_utf8_lossy(&header[..3]).to_string();
    let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if size < 8 || size > 1 << 22 {
        bail!("implausible frame size {}", size);
    }
    let mut body = vec![0u8; size - 8];
    timeout(step, stream.read_exact(&mut body))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    Ok((kind, body))
}

/// Strip the MSG security/sequence headers and check the payload type id.
fn unwrap_service_response(body: &[u8], expected_id: u16) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(body);
    reader.skip(4)?; // channel id
    reader.skip(4)?; // token id
    reader.skip(4)?; // sequence
    reader.skip(4)?; // request id
    let type_id = read_node_id_raw(&mut reader)?;
    let numeric = node_id_numeric(&type_id)
        .ok_or_else(|| anyhow!("non-numeric response type id"))?;
    if numeric == 397 {
        // ServiceFault
        bail!("service fault");
    }
    if numeric != expected_id as u32 {
        bail!("expected response {} got {}", expected_id, numeric);
    }
    Ok(reader.take(reader.remaining())?.to_vec())
}

#[derive(Debug, Default)]
pub struct BuildInfo {
    pub product_uri: Option<String>,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub software_version: Option<String>,
    pub build_number: Option<String>,
    pub build_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ServerStatus {
    pub start_time: Option<DateTime<Utc>>,
    pub current_time: Option<DateTime<Utc>>,
    pub state: Option<i32>,
    pub build_info: BuildInfo,
}

pub fn server_state_name(state: i32) -> &'static str {
    match state {
        0 => "running",
        1 => "failed",
        2 => "no-configuration",
        3 => "suspended",
        4 => "shutdown",
        5 => "test",
        6 => "communication-fault",
        _ => "unknown",
    }
}

/// Decode a ServerStatusDataType body.
pub fn parse_server_status(body: &[u8]) -> Result<ServerStatus> {
    let mut reader = ByteReader::new(body);
    let start_ticks = reader.i64_le()?;
    let current_ticks = reader.i64_le()?;
    let state = reader.i32_le()?;

    let mut build_info = BuildInfo {
        product_uri: read_string(&mut reader)?,
        manufacturer: read_string(&mut reader)?,
        product_name: read_string(&mut reader)?,
        software_version: read_string(&mut reader)?,
        build_number: read_string(&mut reader)?,
        build_date: None,
    };
    if let Ok(ticks) = reader.i64_le() {
        build_info.build_date = ticks_to_datetime(ticks);
    }

    Ok(ServerStatus {
        start_time: ticks_to_datetime(start_ticks),
        current_time: ticks_to_datetime(current_ticks),
        state: Some(state),
        build_info,
    })
}

/// Skip the optional DataValue fields that follow the value.
fn skip_data_value_extras(reader: &mut ByteReader, mask: u8) -> Result<()> {
    if mask & 0x02 != 0 {
        reader.skip(4)?; // status code
    }
    if mask & 0x04 != 0 {
        reader.skip(8)?; // source timestamp
    }
    if mask & 0x10 != 0 {
        reader.skip(2)?; // source picoseconds
    }
    if mask & 0x08 != 0 {
        reader.skip(8)?; // server timestamp
    }
    if mask & 0x20 != 0 {
        reader.skip(2)?; // server picoseconds
    }
    Ok(())
}

struct UaSession {
    stream: TcpStream,
    channel: Channel,
    auth_token: Vec<u8>,
    step: Duration,
}

impl UaSession {
    async fn connect(host: Ipv4Addr, port: u16, step: Duration) -> Result<Self> {
        let endpoint = format!("opc.tcp://{host}:{port}");
        let mut stream = tcp_connect(host, port, step).await?;

        stream.write_all(&hello_message(&endpoint)).await?;
        let (kind, _ack) = read_frame(&mut stream, step).await?;
        if kind != "ACK" {
            bail!("expected ACK, got {}", kind);
        }

        stream.write_all(&open_secure_channel_message(1)).await?;
        let (kind, body) = read_frame(&mut stream, step).await?;
        if kind != "OPN" {
            bail!("expected OPN, got {}", kind);
        }

        let mut reader = ByteReader::new(&body);
        reader.skip(4)?; // secure channel id (header copy)
        let _policy = read_string(&mut reader)?;
        let _sender_cert = read_bytestring(&mut reader)?;
        let _thumbprint = read_bytestring(&mut reader)?;
        reader.skip(8)?; // sequence header
        let type_id = read_node_id_raw(&mut reader)?;
        if node_id_numeric(&type_id) != Some(ID_OPEN_SECURE_CHANNEL_RESPONSE as u32) {
            bail!("secure channel not opened");
        }
        let service_result = read_response_header(&mut reader)?;
        if service_result != 0 {
            bail!("OpenSecureChannel failed with {:#010x}", service_result);
        }
        reader.skip(4)?; // server protocol version
        let channel_id = reader.u32_le()?;
        let token_id = reader.u32_le()?;

        let mut auth_token = Vec::new();
        put_null_node_id(&mut auth_token);

        Ok(Self {
            stream,
            channel: Channel {
                channel_id,
                token_id,
                sequence: 1,
            },
            auth_token,
            step,
        })
    }

    async fn request(&mut self, payload: &[u8], expected_id: u16) -> Result<Vec<u8>> {
        let frame = msg_message(&mut self.channel, payload);
        self.stream.write_all(&frame).await?;
        let (kind, body) = read_frame(&mut self.stream, self.step).await?;
        if kind != "MSG" {
            bail!("expected MSG, got {}", kind);
        }
        unwrap_service_response(&body, expected_id)
    }

    async fn create_session(&mut self, endpoint: &str) -> Result<()> {
        let mut payload = Vec::new();
        put_node_id(&mut payload, ID_CREATE_SESSION_REQUEST);
        let auth = self.auth_token.clone();
        put_request_header(&mut payload, &auth, 2);
        // Client description
        put_string(&mut payload, Some("urn:hostscout"));
        put_string(&mut payload, Some("urn:hostscout:product"));
        payload.push(0x02); // localized text: text only
        put_string(&mut payload, Some("hostscout"));
        put_u32(&mut payload, 1); // application type: client
        put_string(&mut payload, None); // gateway server uri
        put_string(&mut payload, None); // discovery profile uri
        put_i32(&mut payload, -1); // discovery urls: null array
        put_string(&mut payload, None); // server uri
        put_string(&mut payload, Some(endpoint));
        put_string(&mut payload, Some("hostscout-session"));
        put_i32(&mut payload, -1); // client nonce
        put_i32(&mut payload, -1); // client certificate
        put_f64(&mut payload, 60_000.0); // requested session timeout
        put_u32(&mut payload, 1 << 20); // max response size

        let response = self.request(&payload, ID_CREATE_SESSION_RESPONSE).await?;
        let mut reader = ByteReader::new(&response);
        let service_result = read_response_header(&mut reader)?;
        if service_result != 0 {
            bail!("CreateSession failed with {:#010x}", service_result);
        }
        let _session_id = read_node_id_raw(&mut reader)?;
        self.auth_token = read_node_id_raw(&mut reader)?;
        Ok(())
    }

    async fn activate_session(&mut self) -> Result<()> {
        let mut payload = Vec::new();
        put_node_id(&mut payload, ID_ACTIVATE_SESSION_REQUEST);
        let auth = self.auth_token.clone();
        put_request_header(&mut payload, &auth, 3);
        put_string(&mut payload, None); // client signature algorithm
        put_i32(&mut payload, -1); // client signature data
        put_i32(&mut payload, -1); // software certificates: null
        put_i32(&mut payload, -1); // locale ids: null
        // Anonymous identity token as an extension object
        put_node_id(&mut payload, ID_ANONYMOUS_IDENTITY_TOKEN);
        payload.push(0x01); // body is a bytestring
        let mut token_body = Vec::new();
        put_string(&mut token_body, Some("anonymous"));
        put_i32(&mut payload, token_body.len() as i32);
        payload.extend_from_slice(&token_body);
        put_string(&mut payload, None); // token signature algorithm
        put_i32(&mut payload, -1); // token signature data

        let response = self.request(&payload, ID_ACTIVATE_SESSION_RESPONSE).await?;
        let mut reader = ByteReader::new(&response);
        let service_result = read_response_header(&mut reader)?;
        if service_result != 0 {
            bail!("ActivateSession failed with {:#010x}", service_result);
        }
        Ok(())
    }

    /// Read the Value attribute of both server nodes in one request.
    async fn read_server_nodes(&mut self) -> Result<(Option<ServerStatus>, Vec<String>)> {
        let mut payload = Vec::new();
        put_node_id(&mut payload, ID_READ_REQUEST);
        let auth = self.auth_token.clone();
        put_request_header(&mut payload, &auth, 4);
        put_f64(&mut payload, 0.0); // max age
        put_u32(&mut payload, 0); // timestamps: source
        put_i32(&mut payload, 2); // nodes to read
        for node in [NODE_SERVER_STATUS, NODE_SERVER_ARRAY] {
            put_node_id(&mut payload, node);
            put_u32(&mut payload, ATTRIBUTE_VALUE);
            put_string(&mut payload, None); // index range
            payload.extend_from_slice(&0u16.to_le_bytes()); // qualified name ns
            put_string(&mut payload, None); // qualified name
        }

        let response = self.request(&payload, ID_READ_RESPONSE).await?;
        let mut reader = ByteReader::new(&response);
        let service_result = read_response_header(&mut reader)?;
        if service_result != 0 {
            bail!("Read failed with {:#010x}", service_result);
        }
        let result_count = reader.i32_le()?;
        if result_count < 1 {
            bail!("read returned no results");
        }

        // First result: ServerStatus extension object
        let mut status = None;
        let mask = reader.u8()?;
        if mask & 0x01 != 0 {
            let variant_type = reader.u8()?;
            if variant_type & 0x3F == 22 {
                let _type_id = read_node_id_raw(&mut reader)?;
                let encoding = reader.u8()?;
                if encoding == 0x01 {
                    let body = read_bytestring(&mut reader)?
                        .ok_or_else(|| anyhow!("empty extension object"))?;
                    status = parse_server_status(&body).ok();
                }
            } else {
                bail!("server status value has variant type {}", variant_type);
            }
        }
        skip_data_value_extras(&mut reader, mask)?;

        // Second result: the server URI array
        let mut server_array = Vec::new();
        if result_count > 1 && reader.remaining() > 0 {
            let mask = reader.u8()?;
            if mask & 0x01 != 0 {
                let variant_type = reader.u8()?;
                if variant_type & 0x3F == 12 && variant_type & 0x80 != 0 {
                    let count = reader.i32_le()?;
                    for _ in 0..count.clamp(0, 64) {
                        if let Some(uri) = read_string(&mut reader)? {
                            server_array.push(uri);
                        }
                    }
                }
            }
        }

        Ok((status, server_array))
    }
}

#[derive(Default)]
pub struct OpcuaAdapter;

#[async_trait]
impl Adapter for OpcuaAdapter {
    fn name(&self) -> &'static str {
        "opcua"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["opcua", "opc-ua"]
    }

    fn default_port(&self) -> u16 {
        OPCUA_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        // Preflight: connection refused means nothing is listening, skip
        // before speaking any UA.
        let step = options.slice(0.15).max(Duration::from_millis(500));
        match tcp_connect(host, port, step).await {
            Ok(stream) => drop(stream),
            Err(e) => {
                tracing::trace!("opcua preflight {}:{} - {}", host, port, e);
                return Vec::new();
            }
        }

        let result = async {
            let mut session = UaSession::connect(host, port, step).await?;
            let endpoint = format!("opc.tcp://{host}:{port}");
            session.create_session(&endpoint).await?;
            session.activate_session().await?;
            session.read_server_nodes().await
        }
        .await;

        let (status, server_array) = match result {
            Ok(read) => read,
            Err(e) => {
                tracing::trace!("opcua probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let mut metric = Metric::new("opcua").tag("port", &port.to_string());
        if let Some(status) = status {
            metric = metric
                .field_opt("state", status.state.map(|s| server_state_name(s)))
                .field_opt(
                    "start_time",
                    status.start_time.map(|t| t.to_rfc3339()),
                )
                .field_opt(
                    "current_time",
                    status.current_time.map(|t| t.to_rfc3339()),
                )
                .field_opt("product_uri", status.build_info.product_uri.as_deref())
                .field_opt("manufacturer", status.build_info.manufacturer.as_deref())
                .field_opt("product_name", status.build_info.product_name.as_deref())
                .field_opt(
                    "software_version",
                    status.build_info.software_version.as_deref(),
                )
                .field_opt("build_number", status.build_info.build_number.as_deref())
                .field_opt(
                    "build_date",
                    status.build_info.build_date.map(|t| t.to_rfc3339()),
                );
        }
        if !server_array.is_empty() {
            metric = metric.field("server_array", server_array.join(","));
        }
        if metric.fields.is_empty() {
            return Vec::new();
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<OpcuaAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_shape() {
        let endpoint = "opc.tcp://192.0.2.1:4840";
        let hello = hello_message(endpoint);
        assert_eq!(&hello[..4], b"HELF");
        let size = u32::from_le_bytes(hello[4..8].try_into().unwrap()) as usize;
        assert_eq!(size, hello.len());
        let text = String::from_utf8_lossy(&hello);
        assert!(text.contains(endpoint));
    }

    #[test]
    fn open_secure_channel_uses_policy_none() {
        let frame = open_secure_channel_message(1);
        assert_eq!(&frame[..4], b"OPNF");
        let text = String::from_utf8_lossy(&frame);
        assert!(text.contains("SecurityPolicy#None"));
    }

    #[test]
    fn node_id_round_trip() {
        let mut raw = Vec::new();
        put_node_id(&mut raw, NODE_SERVER_STATUS);
        assert_eq!(node_id_numeric(&raw), Some(2256));

        let two_byte = [0x00u8, 0x54];
        assert_eq!(node_id_numeric(&two_byte), Some(0x54));
    }

    fn server_status_body() -> Vec<u8> {
        let mut body = Vec::new();
        let now = ua_now();
        put_i64(&mut body, now - 36_000_000_000); // started an hour ago
        put_i64(&mut body, now);
        put_i32(&mut body, 0); // running
        put_string(&mut body, Some("urn:demo:server"));
        put_string(&mut body, Some("Acme Controls"));
        put_string(&mut body, Some("Acme UA Server"));
        put_string(&mut body, Some("1.4.2"));
        put_string(&mut body, Some("512"));
        put_i64(&mut body, now - 100_000_000_000);
        put_u32(&mut body, 0); // seconds till shutdown
        body.push(0x00); // shutdown reason: empty localized text
        body
    }

    #[test]
    fn server_status_parses() {
        let status = parse_server_status(&server_status_body()).unwrap();
        assert_eq!(status.state, Some(0));
        assert_eq!(server_state_name(status.state.unwrap()), "running");
        assert_eq!(status.build_info.manufacturer.as_deref(), Some("Acme Controls"));
        assert_eq!(status.build_info.product_name.as_deref(), Some("Acme UA Server"));
        assert_eq!(status.build_info.software_version.as_deref(), Some("1.4.2"));
        assert_eq!(status.build_info.build_number.as_deref(), Some("512"));
        let start = status.start_time.unwrap();
        let current = status.current_time.unwrap();
        assert!(current > start);
    }

    #[test]
    fn server_status_tolerates_truncation() {
        let body = server_status_body();
        for cut in 0..body.len() {
            let _ = parse_server_status(&body[..cut]);
        }
    }

    #[test]
    fn datetime_conversion() {
        assert!(ticks_to_datetime(0).is_none());
        assert!(ticks_to_datetime(-5).is_none());
        let now_ticks = ua_now();
        let converted = ticks_to_datetime(now_ticks).unwrap();
        assert!((converted - Utc::now()).num_seconds().abs() < 2);
    }

    #[test]
    fn response_header_round_trip() {
        let mut raw = Vec::new();
        put_i64(&mut raw, ua_now());
        put_u32(&mut raw, 4);
        put_u32(&mut raw, 0); // service result: good
        raw.push(0x00); // empty diagnostics
        put_i32(&mut raw, -1); // string table: null
        put_null_node_id(&mut raw);
        raw.push(0x00);

        let mut reader = ByteReader::new(&raw);
        assert_eq!(read_response_header(&mut reader).unwrap(), 0);
        assert_eq!(reader.remaining(), 0);
    }
}
