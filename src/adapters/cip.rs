//! EtherNet/IP identification. Over TCP: register a session and read the
//! Identity Object attributes, falling back through backplane slots 0-3
//! wrapped in Unconnected Send. Over UDP: a single List-Identity command.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::util::{ByteReader, clean_text, tcp_connect, udp_exchange};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

pub const ENIP_PORT: u16 = 44818;
const CMD_LIST_IDENTITY: u16 = 0x0063;
const CMD_REGISTER_SESSION: u16 = 0x0065;
const CMD_SEND_RR_DATA: u16 = 0x006F;
const SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
const SERVICE_UNCONNECTED_SEND: u8 = 0x52;

fn encap_header(command: u16, session: u32, data_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + data_len);
    out.extend_from_slice(&command.to_le_bytes());
    out.extend_from_slice(&(data_len as u16).to_le_bytes());
    out.extend_from_slice(&session.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // status
    out.extend_from_slice(b"hostscot"); // sender context
    out.extend_from_slice(&0u32.to_le_bytes()); // options
    out
}

pub fn register_session_request() -> Vec<u8> {
    let mut out = encap_header(CMD_REGISTER_SESSION, 0, 4);
    out.extend_from_slice(&1u16.to_le_bytes()); // protocol version
    out.extend_from_slice(&0u16.to_le_bytes()); // options flags
    out
}

/// Message Router request for one Identity Object attribute.
fn identity_attribute_request(attribute: u8) -> Vec<u8> {
    vec![
        SERVICE_GET_ATTRIBUTE_SINGLE,
        0x03, // path size in words
        0x20, 0x01, // class: Identity
        0x24, 0x01, // instance 1
        0x30, attribute,
    ]
}

/// Wrap a Message Router request in Unconnected Send routed to a backplane
/// slot.
fn unconnected_send(embedded: &[u8], slot: u8) -> Vec<u8> {
    let mut out = vec![
        SERVICE_UNCONNECTED_SEND,
        0x02, // path size
        0x20, 0x06, // class: Connection Manager
        0x24, 0x01, // instance 1
        0x0A, // priority/time tick
        0x0E, // timeout ticks
    ];
    out.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
    out.extend_from_slice(embedded);
    if embedded.len() % 2 == 1 {
        out.push(0x00);
    }
    out.push(0x01); // route path size in words
    out.push(0x00); // reserved
    out.push(0x01); // port 1 (backplane)
    out.push(slot);
    out
}

fn send_rr_data(session: u32, mr_request: &[u8]) -> Vec<u8> {
    let mut cpf = Vec::new();
    cpf.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    cpf.extend_from_slice(&10u16.to_le_bytes()); // timeout
    cpf.extend_from_slice(&2u16.to_le_bytes()); // item count
    cpf.extend_from_slice(&0x0000u16.to_le_bytes()); // null address item
    cpf.extend_from_slice(&0u16.to_le_bytes());
    cpf.extend_from_slice(&0x00B2u16.to_le_bytes()); // unconnected data item
    cpf.extend_from_slice(&(mr_request.len() as u16).to_le_bytes());
    cpf.extend_from_slice(mr_request);

    let mut out = encap_header(CMD_SEND_RR_DATA, session, cpf.len());
    out.extend_from_slice(&cpf);
    out
}

/// Strip encapsulation and CPF down to the Message Router reply payload.
fn unwrap_rr_reply(raw: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(raw);
    let command = reader.u16_le()?;
    if command != CMD_SEND_RR_DATA {
        bail!("unexpected encapsulation command {:#06x}", command);
    }
    let length = reader.u16_le()? as usize;
    reader.skip(4)?; // session
    let status = reader.u32_le()?;
    if status != 0 {
        bail!("encapsulation status {:#010x}", status);
    }
    reader.skip(12)?; // context + options
    if length < 16 {
        bail!("RR data too short");
    }
    reader.skip(6)?; // interface handle + timeout
    let item_count = reader.u16_le()? as usize;
    let mut payload = None;
    for _ in 0..item_count {
        let item_type = reader.u16_le()?;
        let item_len = reader.u16_le()? as usize;
        let item = reader.take(item_len.min(reader.remaining()))?;
        if item_type == 0x00B2 {
            payload = Some(item.to_vec());
        }
    }
    payload.ok_or_else(|| anyhow!("no unconnected data item in reply"))
}

/// Decode a Message Router reply; unwraps an Unconnected Send layer when the
/// reply came back routed.
fn mr_reply_data(payload: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(payload);
    let service = reader.u8()?;
    reader.skip(1)?; // reserved
    let general_status = reader.u8()?;
    let additional_words = reader.u8()? as usize;
    reader.skip(additional_words * 2)?;
    if general_status != 0 {
        bail!("CIP general status {:#04x}", general_status);
    }
    let data = reader.take(reader.remaining())?.to_vec();
    if service == SERVICE_UNCONNECTED_SEND | 0x80 {
        return mr_reply_data(&data);
    }
    Ok(data)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IdentityItem {
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: Option<(u8, u8)>,
    pub serial: Option<u32>,
    pub product_name: Option<String>,
}

pub fn device_type_name(device_type: u16) -> Option<&'static str> {
    match device_type {
        0x00 => Some("Generic Device"),
        0x02 => Some("AC Drive"),
        0x07 => Some("General Purpose Discrete I/O"),
        0x0C => Some("Communications Adapter"),
        0x0E => Some("Programmable Logic Controller"),
        0x10 => Some("Position Controller"),
        0x2B => Some("Generic Device (keyable)"),
        _ => None,
    }
}

pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    match vendor_id {
        1 => Some("Rockwell Automation/Allen-Bradley"),
        _ => None,
    }
}

/// Parse the identity item of a List-Identity response.
pub fn parse_list_identity(raw: &[u8]) -> Result<IdentityItem> {
    let mut reader = ByteReader::new(raw);
    let command = reader.u16_le()?;
    if command != CMD_LIST_IDENTITY {
        bail!("not a List-Identity response");
    }
    reader.skip(22)?; // rest of encapsulation header
    let item_count = reader.u16_le()?;
    if item_count == 0 {
        bail!("List-Identity carried no items");
    }
    let item_type = reader.u16_le()?;
    if item_type != 0x000C {
        bail!("first item {:#06x} is not an identity item", item_type);
    }
    reader.skip(2)?; // item length
    reader.skip(2)?; // encapsulation protocol version
    reader.skip(16)?; // sockaddr info
    let vendor_id = reader.u16_le()?;
    let device_type = reader.u16_le()?;
    let product_code = reader.u16_le()?;
    let revision_major = reader.u8()?;
    let revision_minor = reader.u8()?;
    reader.skip(2)?; // status word
    let serial = reader.u32_le()?;
    let name_len = reader.u8()? as usize;
    let product_name = clean_text(reader.take(name_len.min(reader.remaining()))?);

    Ok(IdentityItem {
        vendor_id,
        device_type,
        product_code,
        revision: Some((revision_major, revision_minor)),
        serial: Some(serial),
        product_name: Some(product_name).filter(|n| !n.is_empty()),
    })
}

async fn read_encap_frame(stream: &mut TcpStream, step: Duration) -> Result<Vec<u8>> {
    let mut header = [0u8; 24];
    timeout(step, stream.read_exact(&mut header))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    if length > 8192 {
        bail!("implausible encapsulation length {}", length);
    }
    let mut data = vec![0u8; length];
    timeout(step, stream.read_exact(&mut data))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    let mut frame = header.to_vec();
    frame.extend_from_slice(&data);
    Ok(frame)
}

async fn read_identity_attributes(
    stream: &mut TcpStream,
    session: u32,
    slot: Option<u8>,
    step: Duration,
) -> Result<IdentityItem> {
    let mut identity = IdentityItem::default();
    let mut any = false;

    for attribute in [1u8, 2, 3] {
        let embedded = identity_attribute_request(attribute);
        let mr_request = match slot {
            Some(slot) => unconnected_send(&embedded, slot),
            None => embedded,
        };
        stream.write_all(&send_rr_data(session, &mr_request)).await?;
        let frame = read_encap_frame(stream, step).await?;
        let payload = unwrap_rr_reply(&frame)?;
        let data = match mr_reply_data(&payload) {
            Ok(data) if data.len() >= 2 => data,
            _ => continue,
        };
        let value = u16::from_le_bytes([data[0], data[1]]);
        any = true;
        match attribute {
            1 => identity.vendor_id = value,
            2 => identity.device_type = value,
            3 => identity.product_code = value,
            _ => {}
        }
    }

    if !any {
        bail!("no identity attributes readable");
    }
    Ok(identity)
}

async fn tcp_identity(
    host: Ipv4Addr,
    port: u16,
    options: &ProbeOptions,
) -> Result<(IdentityItem, Option<u8>)> {
    let step = options.slice(0.15).max(Duration::from_millis(400));
    let mut stream = tcp_connect(host, port, step).await?;

    stream.write_all(&register_session_request()).await?;
    let frame = read_encap_frame(&mut stream, step).await?;
    let mut reader = ByteReader::new(&frame);
    let command = reader.u16_le()?;
    reader.skip(2)?;
    let session = reader.u32_le()?;
    if command != CMD_REGISTER_SESSION || session == 0 {
        bail!("session registration refused");
    }

    // Direct request first, then routed through slots 0-3.
    if let Ok(identity) = read_identity_attributes(&mut stream, session, None, step).await {
        return Ok((identity, None));
    }
    for slot in 0u8..4 {
        if options.remaining().is_zero() {
            break;
        }
        if let Ok(identity) =
            read_identity_attributes(&mut stream, session, Some(slot), step).await
        {
            return Ok((identity, Some(slot)));
        }
    }
    bail!("identity object unreachable on any slot")
}

#[derive(Default)]
pub struct CipAdapter;

#[async_trait]
impl Adapter for CipAdapter {
    fn name(&self) -> &'static str {
        "cip"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["enip", "ethernet-ip", "cip"]
    }

    fn default_port(&self) -> u16 {
        ENIP_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let udp_budget = options.slice(0.3).max(Duration::from_millis(400));
        let list_identity = async {
            let request = encap_header(CMD_LIST_IDENTITY, 0, 0);
            match udp_exchange(SocketAddr::from((host, port)), &request, udp_budget).await {
                Ok(Some(raw)) => parse_list_identity(&raw).ok(),
                _ => None,
            }
        };

        let (tcp_result, udp_identity) = tokio::join!(tcp_identity(host, port, options), list_identity);

        let mut metric = Metric::new("cip").tag("port", &port.to_string());
        let mut any = false;

        if let Some(identity) = udp_identity {
            any = true;
            metric = metric
                .field("udp_vendor_id", identity.vendor_id as i64)
                .field("udp_device_type", identity.device_type as i64)
                .field("udp_product_code", identity.product_code as i64)
                .field_opt("serial", identity.serial.map(|s| s as i64))
                .field_opt("product_name", identity.product_name.as_deref())
                .field_opt(
                    "revision",
                    identity.revision.map(|(major, minor)| format!("{major}.{minor}")),
                );
            if let Some(name) = device_type_name(identity.device_type) {
                metric = metric.field("device_type_name", name);
            }
            if let Some(name) = vendor_name(identity.vendor_id) {
                metric = metric.field("vendor", name);
            }
        }

        match tcp_result {
            Ok((identity, slot)) => {
                any = true;
                metric = metric
                    .field("vendor_id", identity.vendor_id as i64)
                    .field("device_type", identity.device_type as i64)
                    .field("product_code", identity.product_code as i64)
                    .field_opt("slot", slot.map(|s| s as i64));
                if let Some(name) = device_type_name(identity.device_type) {
                    metric = metric.field("device_type_name", name);
                }
                if let Some(name) = vendor_name(identity.vendor_id) {
                    metric = metric.field("vendor", name);
                }
            }
            Err(e) => tracing::trace!("cip tcp probe {}:{} - {}", host, port, e),
        }

        if any { vec![metric] } else { Vec::new() }
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<CipAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    fn list_identity_fixture() -> Vec<u8> {
        let name = b"1769-L32E Ethernet Port";
        let item_len = 2 + 16 + 2 + 2 + 2 + 2 + 2 + 4 + 1 + name.len() + 1;
        let mut data = Vec::new();
        data.extend_from_slice(&1u16.to_le_bytes()); // item count
        data.extend_from_slice(&0x000Cu16.to_le_bytes());
        data.extend_from_slice(&(item_len as u16).to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // encap version
        data.extend_from_slice(&[0u8; 16]); // sockaddr
        data.extend_from_slice(&1u16.to_le_bytes()); // vendor: Rockwell
        data.extend_from_slice(&0x000Eu16.to_le_bytes()); // device type: PLC
        data.extend_from_slice(&0x0045u16.to_le_bytes()); // product code
        data.push(20); // revision major
        data.push(13); // revision minor
        data.extend_from_slice(&0x0030u16.to_le_bytes()); // status
        data.extend_from_slice(&0xDEADBEEFu32.to_le_bytes()); // serial
        data.push(name.len() as u8);
        data.extend_from_slice(name);
        data.push(0x03); // state

        let mut frame = encap_header(CMD_LIST_IDENTITY, 0, data.len());
        frame.extend_from_slice(&data);
        frame
    }

    #[test]
    fn register_session_is_28_bytes() {
        let request = register_session_request();
        assert_eq!(request.len(), 28);
        assert_eq!(u16::from_le_bytes([request[0], request[1]]), CMD_REGISTER_SESSION);
        assert_eq!(u16::from_le_bytes([request[2], request[3]]), 4);
    }

    #[test]
    fn list_identity_parses() {
        let identity = parse_list_identity(&list_identity_fixture()).unwrap();
        assert_eq!(identity.vendor_id, 1);
        assert_eq!(identity.device_type, 0x0E);
        assert_eq!(identity.product_code, 0x45);
        assert_eq!(identity.revision, Some((20, 13)));
        assert_eq!(identity.serial, Some(0xDEADBEEF));
        assert_eq!(identity.product_name.as_deref(), Some("1769-L32E Ethernet Port"));
        assert_eq!(device_type_name(identity.device_type), Some("Programmable Logic Controller"));
    }

    #[test]
    fn truncated_list_identity_never_panics() {
        let fixture = list_identity_fixture();
        for cut in 0..fixture.len() {
            let _ = parse_list_identity(&fixture[..cut]);
        }
    }

    #[test]
    fn unconnected_send_routes_through_slot() {
        let embedded = identity_attribute_request(1);
        let wrapped = unconnected_send(&embedded, 3);
        assert_eq!(wrapped[0], SERVICE_UNCONNECTED_SEND);
        assert_eq!(*wrapped.last().unwrap(), 3); // slot
        assert_eq!(wrapped[wrapped.len() - 2], 0x01); // backplane port
        let embedded_len = u16::from_le_bytes([wrapped[8], wrapped[9]]) as usize;
        assert_eq!(embedded_len, embedded.len());
    }

    #[test]
    fn rr_reply_unwraps_to_attribute_data() {
        // Build a SendRRData reply carrying a successful Get_Attribute_Single
        let mr_reply = vec![
            SERVICE_GET_ATTRIBUTE_SINGLE | 0x80,
            0x00,
            0x00, // general status: success
            0x00, // no additional status
            0x01, 0x00, // vendor id 1
        ];
        let mut cpf = Vec::new();
        cpf.extend_from_slice(&0u32.to_le_bytes());
        cpf.extend_from_slice(&10u16.to_le_bytes());
        cpf.extend_from_slice(&2u16.to_le_bytes());
        cpf.extend_from_slice(&0x0000u16.to_le_bytes());
        cpf.extend_from_slice(&0u16.to_le_bytes());
        cpf.extend_from_slice(&0x00B2u16.to_le_bytes());
        cpf.extend_from_slice(&(mr_reply.len() as u16).to_le_bytes());
        cpf.extend_from_slice(&mr_reply);
        let mut frame = encap_header(CMD_SEND_RR_DATA, 0x1234, cpf.len());
        frame.extend_from_slice(&cpf);

        let payload = unwrap_rr_reply(&frame).unwrap();
        let data = mr_reply_data(&payload).unwrap();
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 1);
    }

    #[test]
    fn cip_error_status_is_error() {
        let mr_reply = vec![SERVICE_GET_ATTRIBUTE_SINGLE | 0x80, 0x00, 0x05, 0x00];
        assert!(mr_reply_data(&mr_reply).is_err());
    }
}
