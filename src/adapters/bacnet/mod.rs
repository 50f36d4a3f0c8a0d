//! BACnet/IP device identification. Who-Is first; if no I-Am arrives, fall
//! back to reading Object-Name on a fixed list of common device instances.
//! The essential property set is read with ReadPropertyMultiple, then
//! property by property when the device rejects RPM. All scans share a
//! five-slot semaphore because concurrent sockets trip up small stacks.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::limits::BACNET_SLOTS;
use super::util::{ByteReader, clean_text};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

pub mod vendors;

pub const BACNET_PORT: u16 = 47808;
const IAM_WINDOW: Duration = Duration::from_millis(1500);
const DEVICE_OBJECT_TYPE: u32 = 8;
const WILDCARD_INSTANCE: u32 = 4_194_303;
const FALLBACK_INSTANCES: &[u32] = &[WILDCARD_INSTANCE, 1, 0, 10, 100, 1000, 10000];

const PROP_OBJECT_NAME: u8 = 77;
const PROP_VENDOR_NAME: u8 = 121;
const PROP_VENDOR_ID: u8 = 120;
const PROP_MODEL_NAME: u8 = 70;
const PROP_APP_SOFTWARE_VERSION: u8 = 12;
const PROP_FIRMWARE_REVISION: u8 = 44;

const ESSENTIAL_PROPERTIES: &[u8] = &[
    PROP_OBJECT_NAME,
    PROP_VENDOR_ID,
    PROP_MODEL_NAME,
    PROP_APP_SOFTWARE_VERSION,
    PROP_FIRMWARE_REVISION,
    PROP_VENDOR_NAME,
];

fn bvlc_unicast(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x81, 0x0A];
    out.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn npdu_plain() -> [u8; 2] {
    [0x01, 0x00]
}

fn npdu_expecting_reply() -> [u8; 2] {
    [0x01, 0x04]
}

/// Global Who-Is, framed for unicast delivery.
pub fn whois_frame() -> Vec<u8> {
    let mut payload = npdu_plain().to_vec();
    payload.extend_from_slice(&[0x10, 0x08]);
    bvlc_unicast(&payload)
}

fn object_id(object_type: u32, instance: u32) -> u32 {
    (object_type << 22) | (instance & 0x003F_FFFF)
}

/// ReadProperty on one device-object property.
pub fn read_property_frame(invoke_id: u8, instance: u32, property: u8) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x05, invoke_id, 0x0C];
    apdu.push(0x0C); // context tag 0, length 4
    apdu.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, instance).to_be_bytes());
    apdu.push(0x19); // context tag 1, length 1
    apdu.push(property);

    let mut payload = npdu_expecting_reply().to_vec();
    payload.extend_from_slice(&apdu);
    bvlc_unicast(&payload)
}

/// ReadPropertyMultiple over the essential property set.
pub fn read_property_multiple_frame(invoke_id: u8, instance: u32, properties: &[u8]) -> Vec<u8> {
    let mut apdu = vec![0x00, 0x05, invoke_id, 0x0E];
    apdu.push(0x0C);
    apdu.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, instance).to_be_bytes());
    apdu.push(0x1E); // opening tag 1: property references
    for property in properties {
        apdu.push(0x09); // context tag 0, length 1
        apdu.push(*property);
    }
    apdu.push(0x1F); // closing tag 1

    let mut payload = npdu_expecting_reply().to_vec();
    payload.extend_from_slice(&apdu);
    bvlc_unicast(&payload)
}

/// Strip BVLC and NPDU, returning the APDU. Tolerates NPDU source/dest
/// address blocks.
pub fn unwrap_apdu(frame: &[u8]) -> Result<&[u8]> {
    let mut reader = ByteReader::new(frame);
    if reader.u8()? != 0x81 {
        bail!("not a BVLC frame");
    }
    reader.skip(1)?; // function
    let length = reader.u16_be()? as usize;
    if length != frame.len() {
        bail!("BVLC length {} does not match frame {}", length, frame.len());
    }
    if reader.u8()? != 0x01 {
        bail!("unsupported NPDU version");
    }
    let control = reader.u8()?;
    if control & 0x20 != 0 {
        // Destination specifier: DNET, DLEN, DADR
        reader.skip(2)?;
        let dlen = reader.u8()? as usize;
        reader.skip(dlen)?;
    }
    if control & 0x08 != 0 {
        // Source specifier
        reader.skip(2)?;
        let slen = reader.u8()? as usize;
        reader.skip(slen)?;
    }
    if control & 0x20 != 0 {
        reader.skip(1)?; // hop count
    }
    if control & 0x80 != 0 {
        bail!("network-layer message, not an APDU");
    }
    let at = reader.position();
    Ok(&frame[at..])
}

#[derive(Debug, Clone, PartialEq)]
pub struct IAm {
    pub instance: u32,
    pub max_apdu: u32,
    pub segmentation: u8,
    pub vendor_id: u16,
}

/// Application-tagged primitive value.
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetValue {
    Unsigned(u64),
    Enumerated(u32),
    CharacterString(String),
    Other(u8),
}

impl BacnetValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::CharacterString(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => Some(*v),
            Self::Enumerated(v) => Some(*v as u64),
            _ => None,
        }
    }
}

fn read_app_value(reader: &mut ByteReader) -> Result<BacnetValue> {
    let tag = reader.u8()?;
    let tag_number = tag >> 4;
    let mut length = (tag & 0x07) as usize;
    if length == 5 {
        length = reader.u8()? as usize;
    }
    let raw = reader.take(length)?;
    let value = match tag_number {
        2 => BacnetValue::Unsigned(raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)),
        7 => {
            // First byte is the character-set code; strings may carry
            // trailing NULs.
            let body = raw.get(1..).unwrap_or(&[]);
            BacnetValue::CharacterString(clean_text(body))
        }
        9 => BacnetValue::Enumerated(raw.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)),
        12 => BacnetValue::Unsigned(raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)),
        other => BacnetValue::Other(other),
    };
    Ok(value)
}

/// Decode an I-Am APDU.
pub fn parse_iam(apdu: &[u8]) -> Result<IAm> {
    let mut reader = ByteReader::new(apdu);
    if reader.u8()? != 0x10 || reader.u8()? != 0x00 {
        bail!("not an I-Am");
    }
    let object = match read_app_value(&mut reader)? {
        BacnetValue::Unsigned(v) => v as u32,
        _ => bail!("I-Am missing object identifier"),
    };
    if object >> 22 != DEVICE_OBJECT_TYPE {
        bail!("I-Am object is not a device");
    }
    let max_apdu = read_app_value(&mut reader)?
        .as_unsigned()
        .ok_or_else(|| anyhow!("I-Am missing max APDU"))? as u32;
    let segmentation = read_app_value(&mut reader)?
        .as_unsigned()
        .ok_or_else(|| anyhow!("I-Am missing segmentation"))? as u8;
    let vendor_id = read_app_value(&mut reader)?
        .as_unsigned()
        .ok_or_else(|| anyhow!("I-Am missing vendor id"))? as u16;

    Ok(IAm {
        instance: object & 0x003F_FFFF,
        max_apdu,
        segmentation,
        vendor_id,
    })
}

/// Decode a ReadProperty complex ack into (property, value).
pub fn parse_read_property_ack(apdu: &[u8], invoke_id: u8) -> Result<(u8, BacnetValue)> {
    let mut reader = ByteReader::new(apdu);
    let pdu_type = reader.u8()?;
    if pdu_type & 0xF0 == 0x50 || pdu_type & 0xF0 == 0x60 || pdu_type & 0xF0 == 0x70 {
        bail!("request rejected");
    }
    if pdu_type & 0xF0 != 0x30 {
        bail!("not a complex ack");
    }
    if reader.u8()? != invoke_id {
        bail!("invoke id mismatch");
    }
    if reader.u8()? != 0x0C {
        bail!("not a ReadProperty ack");
    }
    if reader.u8()? != 0x0C {
        bail!("missing object identifier");
    }
    reader.skip(4)?;
    if reader.u8()? != 0x19 {
        bail!("missing property identifier");
    }
    let property = reader.u8()?;
    if reader.u8()? != 0x3E {
        bail!("missing opening tag");
    }
    let value = read_app_value(&mut reader)?;
    Ok((property, value))
}

/// Decode a ReadPropertyMultiple complex ack into (property, value) pairs.
pub fn parse_rpm_ack(apdu: &[u8], invoke_id: u8) -> Result<Vec<(u8, BacnetValue)>> {
    let mut reader = ByteReader::new(apdu);
    let pdu_type = reader.u8()?;
    if pdu_type & 0xF0 != 0x30 {
        bail!("not a complex ack");
    }
    if reader.u8()? != invoke_id {
        bail!("invoke id mismatch");
    }
    if reader.u8()? != 0x0E {
        bail!("not an RPM ack");
    }
    if reader.u8()? != 0x0C {
        bail!("missing object identifier");
    }
    reader.skip(4)?;
    if reader.u8()? != 0x1E {
        bail!("missing list of results");
    }

    let mut results = Vec::new();
    while reader.remaining() > 0 {
        let tag = reader.u8()?;
        if tag == 0x1F {
            break;
        }
        if tag != 0x29 {
            bail!("expected property identifier tag, found {:#04x}", tag);
        }
        let property = reader.u8()?;
        match reader.u8()? {
            0x4E => {
                let value = read_app_value(&mut reader)?;
                results.push((property, value));
                if reader.u8()? != 0x4F {
                    bail!("unterminated property value");
                }
            }
            0x5E => {
                // Property access error: error class + code, then closing tag
                let _ = read_app_value(&mut reader)?;
                let _ = read_app_value(&mut reader)?;
                if reader.u8()? != 0x5F {
                    bail!("unterminated property error");
                }
            }
            other => bail!("unexpected tag {:#04x} in read result", other),
        }
    }
    Ok(results)
}

async fn request_reply(
    socket: &UdpSocket,
    target: SocketAddr,
    frame: &[u8],
    step: Duration,
) -> Result<Vec<u8>> {
    socket.send_to(frame, target).await?;
    let mut buf = vec![0u8; 1500];
    let deadline = tokio::time::Instant::now() + step;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            bail!("timed out");
        }
        match timeout(deadline - now, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from.ip() != target.ip() {
                    continue;
                }
                return Ok(buf[..len].to_vec());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("timed out"),
        }
    }
}

struct PropertySet {
    object_name: Option<String>,
    vendor_id: Option<u16>,
    vendor_name: Option<String>,
    model_name: Option<String>,
    software_version: Option<String>,
    firmware: Option<String>,
}

fn absorb_property(set: &mut PropertySet, property: u8, value: &BacnetValue) {
    match property {
        PROP_OBJECT_NAME => set.object_name = value.as_text().map(str::to_string),
        PROP_VENDOR_ID => set.vendor_id = value.as_unsigned().map(|v| v as u16),
        PROP_VENDOR_NAME => set.vendor_name = value.as_text().map(str::to_string),
        PROP_MODEL_NAME => set.model_name = value.as_text().map(str::to_string),
        PROP_APP_SOFTWARE_VERSION => {
            set.software_version = value.as_text().map(str::to_string)
        }
        PROP_FIRMWARE_REVISION => set.firmware = value.as_text().map(str::to_string),
        _ => {}
    }
}

#[derive(Default)]
pub struct BacnetAdapter;

#[async_trait]
impl Adapter for BacnetAdapter {
    fn name(&self) -> &'static str {
        "bacnet"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["bacnet"]
    }

    fn default_port(&self) -> u16 {
        BACNET_PORT
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let _permit = match BACNET_SLOTS.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Vec::new(),
        };

        let target = SocketAddr::from((host, port));
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::trace!("bacnet probe {}:{} - bind failed: {}", host, port, e);
                return Vec::new();
            }
        };

        // Who-Is, then a fixed window for I-Am responses.
        let mut iam = None;
        if socket.send_to(&whois_frame(), target).await.is_ok() {
            let responses =
                super::util::collect_responses(&socket, host, IAM_WINDOW, IAM_WINDOW).await;
            iam = responses
                .iter()
                .filter_map(|frame| unwrap_apdu(frame).ok())
                .filter_map(|apdu| parse_iam(apdu).ok())
                .next();
        }

        let step = Duration::from_millis(400);
        let mut invoke_id = 1u8;

        // No I-Am: poke the common device instances one by one.
        let mut instance = iam.as_ref().map(|iam| iam.instance);
        if instance.is_none() {
            for &candidate in FALLBACK_INSTANCES {
                if options.remaining().is_zero() {
                    break;
                }
                let frame = read_property_frame(invoke_id, candidate, PROP_OBJECT_NAME);
                if let Ok(reply) = request_reply(&socket, target, &frame, step).await {
                    if let Ok(apdu) = unwrap_apdu(&reply) {
                        if parse_read_property_ack(apdu, invoke_id).is_ok() {
                            instance = Some(candidate);
                            invoke_id = invoke_id.wrapping_add(1);
                            break;
                        }
                    }
                }
                invoke_id = invoke_id.wrapping_add(1);
            }
        }
        let Some(instance) = instance else {
            return Vec::new();
        };

        let mut set = PropertySet {
            object_name: None,
            vendor_id: iam.as_ref().map(|iam| iam.vendor_id),
            vendor_name: None,
            model_name: None,
            software_version: None,
            firmware: None,
        };

        // Essential properties: RPM first, then one by one.
        let rpm_frame = read_property_multiple_frame(invoke_id, instance, ESSENTIAL_PROPERTIES);
        let rpm_result = request_reply(&socket, target, &rpm_frame, step)
            .await
            .and_then(|reply| {
                let apdu = unwrap_apdu(&reply)?.to_vec();
                parse_rpm_ack(&apdu, invoke_id)
            });
        invoke_id = invoke_id.wrapping_add(1);

        match rpm_result {
            Ok(results) if !results.is_empty() => {
                for (property, value) in &results {
                    absorb_property(&mut set, *property, value);
                }
            }
            _ => {
                for &property in ESSENTIAL_PROPERTIES {
                    if options.remaining().is_zero() {
                        break;
                    }
                    let frame = read_property_frame(invoke_id, instance, property);
                    if let Ok(reply) = request_reply(&socket, target, &frame, step).await {
                        if let Ok(apdu) = unwrap_apdu(&reply) {
                            if let Ok((property, value)) =
                                parse_read_property_ack(apdu, invoke_id)
                            {
                                absorb_property(&mut set, property, &value);
                            }
                        }
                    }
                    invoke_id = invoke_id.wrapping_add(1);
                }
            }
        }

        let vendor_name = set.vendor_name.clone().or_else(|| {
            set.vendor_id
                .and_then(vendors::vendor_name)
                .map(str::to_string)
        });

        let mut metric = Metric::new("bacnet")
            .tag("port", &port.to_string())
            .field("device_instance", instance as i64)
            .field_opt("object_name", set.object_name.as_deref())
            .field_opt("vendor_id", set.vendor_id.map(|v| v as i64))
            .field_opt("vendor", vendor_name.as_deref())
            .field_opt("model_name", set.model_name.as_deref())
            .field_opt("software_version", set.software_version.as_deref())
            .field_opt("firmware", set.firmware.as_deref());
        if let Some(iam) = iam {
            metric = metric
                .field("max_apdu", iam.max_apdu as i64)
                .field("segmentation", iam.segmentation as i64);
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<BacnetAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    fn iam_frame(instance: u32, vendor_id: u16) -> Vec<u8> {
        let mut apdu = vec![0x10, 0x00];
        apdu.push(0xC4); // application tag 12, length 4
        apdu.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, instance).to_be_bytes());
        apdu.push(0x22); // unsigned, length 2
        apdu.extend_from_slice(&1476u16.to_be_bytes());
        apdu.push(0x91); // enumerated, length 1
        apdu.push(0x03); // no segmentation
        apdu.push(0x22);
        apdu.extend_from_slice(&vendor_id.to_be_bytes());

        let mut payload = npdu_plain().to_vec();
        payload.extend_from_slice(&apdu);
        bvlc_unicast(&payload)
    }

    #[test]
    fn whois_frame_is_byte_exact() {
        assert_eq!(whois_frame(), vec![0x81, 0x0A, 0x00, 0x08, 0x01, 0x00, 0x10, 0x08]);
    }

    #[test]
    fn iam_parses() {
        let frame = iam_frame(1234, 36);
        let apdu = unwrap_apdu(&frame).unwrap();
        let iam = parse_iam(apdu).unwrap();
        assert_eq!(iam.instance, 1234);
        assert_eq!(iam.max_apdu, 1476);
        assert_eq!(iam.segmentation, 3);
        assert_eq!(iam.vendor_id, 36);
        assert_eq!(vendors::vendor_name(iam.vendor_id), Some("Tridium"));
    }

    #[test]
    fn read_property_ack_with_trailing_nul_string() {
        // Complex ack carrying object-name "AHU-1\0"
        let mut apdu = vec![0x30, 0x07, 0x0C];
        apdu.push(0x0C);
        apdu.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, 99).to_be_bytes());
        apdu.push(0x19);
        apdu.push(PROP_OBJECT_NAME);
        apdu.push(0x3E);
        let text = b"\x00AHU-1\x00";
        apdu.push(0x75); // charstring, extended length
        apdu.push(text.len() as u8);
        apdu.extend_from_slice(text);
        apdu.push(0x3F);

        let (property, value) = parse_read_property_ack(&apdu, 0x07).unwrap();
        assert_eq!(property, PROP_OBJECT_NAME);
        assert_eq!(value.as_text(), Some("AHU-1"));
    }

    #[test]
    fn rpm_ack_mixes_values_and_errors() {
        let mut apdu = vec![0x30, 0x02, 0x0E];
        apdu.push(0x0C);
        apdu.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, 5).to_be_bytes());
        apdu.push(0x1E);
        // vendor id = 10
        apdu.push(0x29);
        apdu.push(PROP_VENDOR_ID);
        apdu.push(0x4E);
        apdu.push(0x21);
        apdu.push(10);
        apdu.push(0x4F);
        // model name: access error
        apdu.push(0x29);
        apdu.push(PROP_MODEL_NAME);
        apdu.push(0x5E);
        apdu.push(0x91);
        apdu.push(0x01);
        apdu.push(0x91);
        apdu.push(0x20);
        apdu.push(0x5F);
        apdu.push(0x1F);

        let results = parse_rpm_ack(&apdu, 0x02).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, PROP_VENDOR_ID);
        assert_eq!(results[0].1.as_unsigned(), Some(10));
    }

    #[test]
    fn reject_pdu_is_an_error() {
        assert!(parse_read_property_ack(&[0x60, 0x07, 0x00], 0x07).is_err());
        assert!(parse_iam(&[0x10, 0x08]).is_err());
    }

    #[test]
    fn malformed_frames_never_panic() {
        let frame = iam_frame(1, 5);
        for cut in 0..frame.len() {
            if let Ok(apdu) = unwrap_apdu(&frame[..cut]) {
                let _ = parse_iam(apdu);
            }
        }
    }

    #[tokio::test]
    async fn whois_fallback_against_local_fixture() {
        // Fixture device: never answers Who-Is, answers ReadProperty
        // object-name only for instance 1000.
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = device.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((n, from)) = device.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(apdu) = unwrap_apdu(&buf[..n]) else {
                    continue;
                };
                if apdu.first() != Some(&0x00) {
                    continue; // ignore Who-Is
                }
                let invoke_id = apdu[2];
                let service = apdu[3];
                let instance_raw =
                    u32::from_be_bytes([apdu[5], apdu[6], apdu[7], apdu[8]]) & 0x003F_FFFF;
                if instance_raw != 1000 {
                    // Reject PDU
                    let mut payload = npdu_plain().to_vec();
                    payload.extend_from_slice(&[0x60, invoke_id, 0x00]);
                    device.send_to(&bvlc_unicast(&payload), from).await.unwrap();
                    continue;
                }
                let response_apdu: Vec<u8> = if service == 0x0C {
                    let mut ack = vec![0x30, invoke_id, 0x0C, 0x0C];
                    ack.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, 1000).to_be_bytes());
                    ack.push(0x19);
                    ack.push(apdu[10]);
                    ack.push(0x3E);
                    let text = b"\x00RTU-4";
                    ack.push(0x75);
                    ack.push(text.len() as u8);
                    ack.extend_from_slice(text);
                    ack.push(0x3F);
                    ack
                } else {
                    // RPM: answer vendor id + object name
                    let mut ack = vec![0x30, invoke_id, 0x0E, 0x0C];
                    ack.extend_from_slice(&object_id(DEVICE_OBJECT_TYPE, 1000).to_be_bytes());
                    ack.push(0x1E);
                    ack.push(0x29);
                    ack.push(PROP_OBJECT_NAME);
                    ack.push(0x4E);
                    let text = b"\x00RTU-4";
                    ack.push(0x75);
                    ack.push(text.len() as u8);
                    ack.extend_from_slice(text);
                    ack.push(0x4F);
                    ack.push(0x29);
                    ack.push(PROP_VENDOR_ID);
                    ack.push(0x4E);
                    ack.push(0x21);
                    ack.push(24);
                    ack.push(0x4F);
                    ack.push(0x1F);
                    ack
                };
                let mut payload = npdu_plain().to_vec();
                payload.extend_from_slice(&response_apdu);
                device.send_to(&bvlc_unicast(&payload), from).await.unwrap();
            }
        });

        let options = ProbeOptions::with_timeout(Duration::from_secs(15));
        let metrics = BacnetAdapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["device_instance"], 1000);
        assert_eq!(metrics[0].fields["object_name"], "RTU-4");
        assert_eq!(metrics[0].fields["vendor_id"], 24);
        assert_eq!(metrics[0].fields["vendor"], "Automated Logic");
    }
}
