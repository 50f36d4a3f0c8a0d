//! SNMPv3 engine discovery: an unauthenticated empty-user probe with a
//! distinguished message ID, and RFC 3411 engine-ID decoding.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};

/// The message ID used by the discovery probe; distinctive enough to pick
/// our own reply out of a capture.
pub const DISCOVERY_MSG_ID: u32 = 0x4A69;

// --- minimal BER ---

fn ber_len(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else if len < 256 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}

fn ber_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    ber_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn ber_int(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 && bytes[start] == 0 && bytes[start + 1] & 0x80 == 0 {
        start += 1;
    }
    ber_tlv(0x02, &bytes[start..])
}

fn ber_octets(value: &[u8]) -> Vec<u8> {
    ber_tlv(0x04, value)
}

pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read one TLV, returning (tag, content).
    pub fn tlv(&mut self) -> Result<(u8, &'a [u8])> {
        if self.pos + 2 > self.data.len() {
            bail!("BER element truncated");
        }
        let tag = self.data[self.pos];
        let first = self.data[self.pos + 1] as usize;
        let (len, header) = if first < 128 {
            (first, 2)
        } else {
            let count = first & 0x7F;
            if count == 0 || count > 4 || self.pos + 2 + count > self.data.len() {
                bail!("unsupported BER length encoding");
            }
            let mut len = 0usize;
            for i in 0..count {
                len = (len << 8) | self.data[self.pos + 2 + i] as usize;
            }
            (len, 2 + count)
        };
        let start = self.pos + header;
        if start + len > self.data.len() {
            bail!("BER content truncated");
        }
        self.pos = start + len;
        Ok((tag, &self.data[start..start + len]))
    }

    pub fn expect(&mut self, want: u8) -> Result<&'a [u8]> {
        let (tag, content) = self.tlv()?;
        if tag != want {
            bail!("expected BER tag {:#04x}, found {:#04x}", want, tag);
        }
        Ok(content)
    }

    pub fn int(&mut self) -> Result<u32> {
        let content = self.expect(0x02)?;
        if content.len() > 5 {
            bail!("integer too wide");
        }
        Ok(content.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }
}

/// Build the Nmap-style v3 discovery message: empty engine ID and user name,
/// reportable flag set, noAuthNoPriv, empty GetRequest.
pub fn build_discovery(request_id: u32) -> Vec<u8> {
    let header = {
        let mut inner = Vec::new();
        inner.extend(ber_int(DISCOVERY_MSG_ID));
        inner.extend(ber_int(65507)); // msgMaxSize
        inner.extend(ber_octets(&[0x04])); // msgFlags: reportable
        inner.extend(ber_int(3)); // msgSecurityModel: USM
        ber_tlv(0x30, &inner)
    };

    let usm_params = {
        let mut inner = Vec::new();
        inner.extend(ber_octets(&[])); // engine ID
        inner.extend(ber_int(0)); // engine boots
        inner.extend(ber_int(0)); // engine time
        inner.extend(ber_octets(&[])); // user name
        inner.extend(ber_octets(&[])); // auth params
        inner.extend(ber_octets(&[])); // priv params
        ber_octets(&ber_tlv(0x30, &inner))
    };

    let scoped_pdu = {
        let pdu = {
            let mut inner = Vec::new();
            inner.extend(ber_int(request_id));
            inner.extend(ber_int(0)); // error-status
            inner.extend(ber_int(0)); // error-index
            inner.extend(ber_tlv(0x30, &[])); // empty varbind list
            ber_tlv(0xA0, &inner)
        };
        let mut inner = Vec::new();
        inner.extend(ber_octets(&[])); // context engine ID
        inner.extend(ber_octets(&[])); // context name
        inner.extend(pdu);
        ber_tlv(0x30, &inner)
    };

    let mut body = Vec::new();
    body.extend(ber_int(3)); // msgVersion
    body.extend(header);
    body.extend(usm_params);
    body.extend(scoped_pdu);
    ber_tlv(0x30, &body)
}

#[derive(Debug, Clone, PartialEq)]
pub struct V3Discovery {
    pub msg_id: u32,
    pub engine_id: Vec<u8>,
    pub engine_boots: u32,
    pub engine_time: u32,
}

/// Pull engine ID, boots and time out of a v3 report message.
pub fn parse_discovery_response(data: &[u8]) -> Result<V3Discovery> {
    let mut outer = BerReader::new(data);
    let message = outer.expect(0x30)?;

    let mut message_reader = BerReader::new(message);
    let version = message_reader.int()?;
    if version != 3 {
        bail!("not an SNMPv3 message (version {})", version);
    }

    let header = message_reader.expect(0x30)?;
    let msg_id = BerReader::new(header).int()?;

    let security_params = message_reader.expect(0x04)?;
    let mut usm_outer = BerReader::new(security_params);
    let usm = usm_outer.expect(0x30)?;
    let mut usm_reader = BerReader::new(usm);
    let engine_id = usm_reader.expect(0x04)?.to_vec();
    let engine_boots = usm_reader.int()?;
    let engine_time = usm_reader.int()?;

    if engine_id.is_empty() {
        bail!("authoritative engine ID is empty");
    }

    Ok(V3Discovery {
        msg_id,
        engine_id,
        engine_boots,
        engine_time,
    })
}

// --- RFC 3411 engine ID formats ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineIdFormat {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac([u8; 6]),
    Text(String),
    Octets(Vec<u8>),
    /// RFC 1910 style: enterprise ID with the high bit clear, 8 opaque bytes.
    Legacy(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineId {
    pub enterprise: u32,
    pub format: EngineIdFormat,
}

impl EngineId {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 5 {
            bail!("engine ID shorter than 5 bytes");
        }
        let head = u32::from_be_bytes(raw[..4].try_into().unwrap());

        if head & 0x8000_0000 == 0 {
            return Ok(Self {
                enterprise: head,
                format: EngineIdFormat::Legacy(raw[4..].to_vec()),
            });
        }

        let enterprise = head & 0x7FFF_FFFF;
        let body = &raw[5..];
        let format = match raw[4] {
            1 => {
                if body.len() != 4 {
                    bail!("ipv4 engine ID body must be 4 bytes");
                }
                EngineIdFormat::Ipv4(Ipv4Addr::new(body[0], body[1], body[2], body[3]))
            }
            2 => {
                if body.len() != 16 {
                    bail!("ipv6 engine ID body must be 16 bytes");
                }
                let octets: [u8; 16] = body.try_into().unwrap();
                EngineIdFormat::Ipv6(Ipv6Addr::from(octets))
            }
            3 => {
                if body.len() != 6 {
                    bail!("mac engine ID body must be 6 bytes");
                }
                EngineIdFormat::Mac(body.try_into().unwrap())
            }
            4 => EngineIdFormat::Text(String::from_utf8_lossy(body).to_string()),
            _ => EngineIdFormat::Octets(body.to_vec()),
        };

        Ok(Self { enterprise, format })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.format {
            EngineIdFormat::Legacy(body) => {
                out.extend_from_slice(&(self.enterprise & 0x7FFF_FFFF).to_be_bytes());
                out.extend_from_slice(body);
            }
            format => {
                out.extend_from_slice(&(self.enterprise | 0x8000_0000).to_be_bytes());
                match format {
                    EngineIdFormat::Ipv4(ip) => {
                        out.push(1);
                        out.extend_from_slice(&ip.octets());
                    }
                    EngineIdFormat::Ipv6(ip) => {
                        out.push(2);
                        out.extend_from_slice(&ip.octets());
                    }
                    EngineIdFormat::Mac(mac) => {
                        out.push(3);
                        out.extend_from_slice(mac);
                    }
                    EngineIdFormat::Text(text) => {
                        out.push(4);
                        out.extend_from_slice(text.as_bytes());
                    }
                    EngineIdFormat::Octets(body) => {
                        out.push(5);
                        out.extend_from_slice(body);
                    }
                    EngineIdFormat::Legacy(_) => unreachable!(),
                }
            }
        }
        out
    }

    pub fn describe(&self) -> String {
        match &self.format {
            EngineIdFormat::Ipv4(ip) => format!("ipv4:{ip}"),
            EngineIdFormat::Ipv6(ip) => format!("ipv6:{ip}"),
            EngineIdFormat::Mac(mac) => format!(
                "mac:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            EngineIdFormat::Text(text) => format!("text:{text}"),
            EngineIdFormat::Octets(body) => {
                format!("octets:{}", body.iter().map(|b| format!("{b:02x}")).collect::<String>())
            }
            EngineIdFormat::Legacy(body) => {
                format!("legacy:{}", body.iter().map(|b| format!("{b:02x}")).collect::<String>())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_message_is_well_formed() {
        let message = build_discovery(0x1234);
        let mut outer = BerReader::new(&message);
        let body = outer.expect(0x30).unwrap();
        assert!(outer.done());

        let mut reader = BerReader::new(body);
        assert_eq!(reader.int().unwrap(), 3);
        let header = reader.expect(0x30).unwrap();
        assert_eq!(BerReader::new(header).int().unwrap(), DISCOVERY_MSG_ID);
    }

    /// A discovery exchange where the agent echoes our header and fills in
    /// its engine parameters.
    fn response_fixture(engine_id: &[u8]) -> Vec<u8> {
        let header = {
            let mut inner = Vec::new();
            inner.extend(ber_int(DISCOVERY_MSG_ID));
            inner.extend(ber_int(65507));
            inner.extend(ber_octets(&[0x00]));
            inner.extend(ber_int(3));
            ber_tlv(0x30, &inner)
        };
        let usm = {
            let mut inner = Vec::new();
            inner.extend(ber_octets(engine_id));
            inner.extend(ber_int(7));
            inner.extend(ber_int(123456));
            inner.extend(ber_octets(&[]));
            inner.extend(ber_octets(&[]));
            inner.extend(ber_octets(&[]));
            ber_octets(&ber_tlv(0x30, &inner))
        };
        let scoped = ber_tlv(0x30, &{
            let mut inner = Vec::new();
            inner.extend(ber_octets(engine_id));
            inner.extend(ber_octets(&[]));
            inner.extend(ber_tlv(0xA8, &[])); // report PDU, contents ignored
            inner
        });
        let mut body = Vec::new();
        body.extend(ber_int(3));
        body.extend(header);
        body.extend(usm);
        body.extend(scoped);
        ber_tlv(0x30, &body)
    }

    #[test]
    fn discovery_response_parses() {
        let engine_id = [0x80, 0x00, 0x1F, 0x88, 0x03, 0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E];
        let response = response_fixture(&engine_id);
        let discovery = parse_discovery_response(&response).unwrap();
        assert_eq!(discovery.msg_id, DISCOVERY_MSG_ID);
        assert_eq!(discovery.engine_id, engine_id);
        assert_eq!(discovery.engine_boots, 7);
        assert_eq!(discovery.engine_time, 123456);
    }

    #[test]
    fn engine_id_round_trips_all_five_formats() {
        let cases = vec![
            EngineId {
                enterprise: 8072,
                format: EngineIdFormat::Ipv4(Ipv4Addr::new(192, 168, 1, 1)),
            },
            EngineId {
                enterprise: 8072,
                format: EngineIdFormat::Ipv6("fe80::1".parse().unwrap()),
            },
            EngineId {
                enterprise: 9,
                format: EngineIdFormat::Mac([0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E]),
            },
            EngineId {
                enterprise: 2021,
                format: EngineIdFormat::Text("router-west".to_string()),
            },
            EngineId {
                enterprise: 311,
                format: EngineIdFormat::Octets(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            },
        ];
        for case in cases {
            let encoded = case.encode();
            let decoded = EngineId::decode(&encoded).unwrap();
            assert_eq!(decoded, case, "round trip failed for {}", case.describe());
        }
    }

    #[test]
    fn legacy_engine_id_decodes() {
        let mut raw = 8072u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let decoded = EngineId::decode(&raw).unwrap();
        assert_eq!(decoded.enterprise, 8072);
        assert!(matches!(decoded.format, EngineIdFormat::Legacy(ref b) if b.len() == 8));
        assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn malformed_engine_ids_rejected() {
        assert!(EngineId::decode(&[0x80, 0x00]).is_err());
        // format says ipv4 but body is 2 bytes
        assert!(EngineId::decode(&[0x80, 0x00, 0x1F, 0x88, 0x01, 0x0A, 0x00]).is_err());
    }

    #[test]
    fn unknown_format_code_falls_back_to_octets() {
        let raw = [0x80, 0x00, 0x1F, 0x88, 0x7F, 0xAA, 0xBB];
        let decoded = EngineId::decode(&raw).unwrap();
        assert_eq!(decoded.format, EngineIdFormat::Octets(vec![0xAA, 0xBB]));
    }

    #[test]
    fn ber_long_form_lengths() {
        let content = vec![0xAB; 300];
        let tlv = ber_tlv(0x04, &content);
        let mut reader = BerReader::new(&tlv);
        let (tag, parsed) = reader.tlv().unwrap();
        assert_eq!(tag, 0x04);
        assert_eq!(parsed.len(), 300);
    }
}
