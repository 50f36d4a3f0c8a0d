//! Modbus/TCP identification: Read Device Identification (function 43/14)
//! tried across the common unit IDs, plus optional probes of the four data
//! spaces at low addresses.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::util::{ByteReader, clean_text, tcp_connect};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

const UNIT_ID_ATTEMPTS: &[u8] = &[1, 0, 255, 2, 3];
const FC_READ_DEVICE_ID: u8 = 0x2B;
const MEI_DEVICE_ID: u8 = 0x0E;

/// One MBAP-framed request/response unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MbapFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

impl MbapFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.pdu.len());
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // protocol identifier
        out.extend_from_slice(&((self.pdu.len() + 1) as u16).to_be_bytes());
        out.push(self.unit_id);
        out.extend_from_slice(&self.pdu);
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(raw);
        let transaction_id = reader.u16_be()?;
        let protocol = reader.u16_be()?;
        if protocol != 0 {
            bail!("protocol identifier {} is not Modbus", protocol);
        }
        let length = reader.u16_be()? as usize;
        if length == 0 {
            bail!("zero-length MBAP frame");
        }
        let unit_id = reader.u8()?;
        let pdu = reader.take(length - 1)?.to_vec();
        Ok(Self {
            transaction_id,
            unit_id,
            pdu,
        })
    }
}

fn device_id_request(transaction_id: u16, unit_id: u8, read_code: u8) -> MbapFrame {
    MbapFrame {
        transaction_id,
        unit_id,
        pdu: vec![FC_READ_DEVICE_ID, MEI_DEVICE_ID, read_code, 0x00],
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct DeviceIdentification {
    pub vendor_name: Option<String>,
    pub product_code: Option<String>,
    pub revision: Option<String>,
    pub vendor_url: Option<String>,
    pub product_name: Option<String>,
    pub model_name: Option<String>,
}

/// Decode a Read Device Identification response PDU.
pub fn parse_device_id(pdu: &[u8]) -> Result<DeviceIdentification> {
    let mut reader = ByteReader::new(pdu);
    let function = reader.u8()?;
    if function == FC_READ_DEVICE_ID | 0x80 {
        bail!("device-id exception code {}", reader.u8().unwrap_or(0));
    }
    if function != FC_READ_DEVICE_ID || reader.u8()? != MEI_DEVICE_ID {
        bail!("not a device identification response");
    }
    reader.skip(1)?; // read device id code
    reader.skip(1)?; // conformity level
    reader.skip(1)?; // more follows
    reader.skip(1)?; // next object id
    let object_count = reader.u8()? as usize;

    let mut identification = DeviceIdentification::default();
    for _ in 0..object_count {
        if reader.remaining() < 2 {
            break;
        }
        let object_id = reader.u8()?;
        let object_len = reader.u8()? as usize;
        let raw = reader.take(object_len.min(reader.remaining()))?;
        let text = clean_text(raw);
        match object_id {
            0x00 => identification.vendor_name = Some(text),
            0x01 => identification.product_code = Some(text),
            0x02 => identification.revision = Some(text),
            0x03 => identification.vendor_url = Some(text),
            0x04 => identification.product_name = Some(text),
            0x05 => identification.model_name = Some(text),
            _ => {}
        }
    }
    Ok(identification)
}

async fn exchange(
    stream: &mut TcpStream,
    frame: &MbapFrame,
    step: Duration,
) -> Result<MbapFrame> {
    stream.write_all(&frame.encode()).await?;

    let mut header = [0u8; 7];
    timeout(step, stream.read_exact(&mut header))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length == 0 || length > 260 {
        bail!("implausible MBAP length {}", length);
    }
    let mut rest = vec![0u8; length - 1];
    timeout(step, stream.read_exact(&mut rest))
        .await
        .map_err(|_| anyhow!("timed out"))??;

    let mut raw = header.to_vec();
    raw.extend_from_slice(&rest);
    MbapFrame::parse(&raw)
}

/// Probe one data space (coils, discrete inputs, holding or input
/// registers) at address 0 and report whether the unit serves it.
async fn probe_space(
    stream: &mut TcpStream,
    transaction_id: u16,
    unit_id: u8,
    function: u8,
    step: Duration,
) -> bool {
    let frame = MbapFrame {
        transaction_id,
        unit_id,
        pdu: vec![function, 0x00, 0x00, 0x00, 0x08],
    };
    match exchange(stream, &frame, step).await {
        Ok(response) => response.pdu.first().copied() == Some(function),
        Err(_) => false,
    }
}

#[derive(Default)]
pub struct ModbusAdapter;

#[async_trait]
impl Adapter for ModbusAdapter {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["modbus"]
    }

    fn default_port(&self) -> u16 {
        502
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let step = options.slice(0.2).max(Duration::from_millis(400));
        let mut stream = match tcp_connect(host, port, step).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::trace!("modbus probe {}:{} - {}", host, port, e);
                return Vec::new();
            }
        };

        let mut transaction_id = 1u16;
        let mut found: Option<(u8, DeviceIdentification)> = None;
        for &unit_id in UNIT_ID_ATTEMPTS {
            if options.remaining().is_zero() {
                break;
            }
            let request = device_id_request(transaction_id, unit_id, 0x01);
            transaction_id = transaction_id.wrapping_add(1);
            match exchange(&mut stream, &request, step).await {
                Ok(response) if response.unit_id == unit_id => {
                    match parse_device_id(&response.pdu) {
                        Ok(identification) => {
                            found = Some((unit_id, identification));
                            break;
                        }
                        Err(e) => tracing::trace!(
                            "modbus {}:{} unit {} - {}",
                            host,
                            port,
                            unit_id,
                            e
                        ),
                    }
                }
                Ok(_) | Err(_) => {}
            }
        }

        let Some((unit_id, identification)) = found else {
            return Vec::new();
        };

        let mut spaces = Vec::new();
        for (function, name) in [
            (0x03u8, "holding"),
            (0x04, "input"),
            (0x01, "coils"),
            (0x02, "discrete"),
        ] {
            if options.remaining().is_zero() {
                break;
            }
            if probe_space(&mut stream, transaction_id, unit_id, function, step).await {
                spaces.push(name);
            }
            transaction_id = transaction_id.wrapping_add(1);
        }

        let mut metric = Metric::new("modbus")
            .tag("port", &port.to_string())
            .field("unit_id", unit_id as i64)
            .field_opt("vendor", identification.vendor_name.as_deref())
            .field_opt("product_code", identification.product_code.as_deref())
            .field_opt("revision", identification.revision.as_deref())
            .field_opt("vendor_url", identification.vendor_url.as_deref())
            .field_opt("product_name", identification.product_name.as_deref())
            .field_opt("model_name", identification.model_name.as_deref());
        if !spaces.is_empty() {
            metric = metric.field("data_spaces", spaces.join(","));
        }

        vec![metric]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<ModbusAdapter>));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbap_frame_round_trips() {
        let frame = MbapFrame {
            transaction_id: 0xBEEF,
            unit_id: 17,
            pdu: vec![0x2B, 0x0E, 0x01, 0x00],
        };
        let parsed = MbapFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn mbap_rejects_wrong_protocol_and_truncation() {
        let mut raw = MbapFrame {
            transaction_id: 1,
            unit_id: 1,
            pdu: vec![0x03],
        }
        .encode();
        raw[2] = 0xFF; // protocol identifier
        assert!(MbapFrame::parse(&raw).is_err());
        assert!(MbapFrame::parse(&[0x00, 0x01, 0x00]).is_err());
    }

    fn device_id_response_pdu() -> Vec<u8> {
        let mut pdu = vec![FC_READ_DEVICE_ID, MEI_DEVICE_ID, 0x01, 0x01, 0x00, 0x00, 0x03];
        for (id, value) in [(0x00u8, "Schneider Electric"), (0x01, "BMX P34"), (0x02, "v2.70")] {
            pdu.push(id);
            pdu.push(value.len() as u8);
            pdu.extend_from_slice(value.as_bytes());
        }
        pdu
    }

    #[test]
    fn device_identification_parses() {
        let identification = parse_device_id(&device_id_response_pdu()).unwrap();
        assert_eq!(identification.vendor_name.as_deref(), Some("Schneider Electric"));
        assert_eq!(identification.product_code.as_deref(), Some("BMX P34"));
        assert_eq!(identification.revision.as_deref(), Some("v2.70"));
        assert!(identification.model_name.is_none());
    }

    #[test]
    fn exception_response_is_an_error() {
        assert!(parse_device_id(&[FC_READ_DEVICE_ID | 0x80, 0x01]).is_err());
        assert!(parse_device_id(&[0x03, 0x02, 0x00, 0x00]).is_err());
    }

    #[tokio::test]
    async fn probe_against_local_fixture() {
        use tokio::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let mut header = [0u8; 7];
                if stream.read_exact(&mut header).await.is_err() {
                    break;
                }
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                let mut pdu = vec![0u8; length - 1];
                stream.read_exact(&mut pdu).await.unwrap();
                let unit_id = header[6];

                let response_pdu = if pdu[0] == FC_READ_DEVICE_ID && unit_id == 1 {
                    device_id_response_pdu()
                } else if pdu[0] == 0x03 && unit_id == 1 {
                    vec![0x03, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
                } else {
                    vec![pdu[0] | 0x80, 0x01]
                };
                let response = MbapFrame {
                    transaction_id: u16::from_be_bytes([header[0], header[1]]),
                    unit_id,
                    pdu: response_pdu,
                };
                stream.write_all(&response.encode()).await.unwrap();
            }
        });

        let options = ProbeOptions::with_timeout(Duration::from_secs(3));
        let metrics = ModbusAdapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["unit_id"], 1);
        assert_eq!(metrics[0].fields["vendor"], "Schneider Electric");
        assert_eq!(metrics[0].fields["data_spaces"], "holding");
    }
}
