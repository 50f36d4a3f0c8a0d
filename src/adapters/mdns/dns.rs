//! Just enough of the DNS wire format for multicast service discovery:
//! building PTR query packets and decoding PTR/SRV/TXT/A answers, including
//! compression pointers.

use std::net::Ipv4Addr;

use anyhow::{Result, bail};

use crate::adapters::util::ByteReader;

pub const TYPE_A: u16 = 1;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_SRV: u16 = 33;
pub const CLASS_IN: u16 = 1;

/// Encode a dotted name into DNS labels.
fn encode_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(63) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(63)]);
    }
    out.push(0);
}

/// Build a query with one PTR question per service name (at most 8).
pub fn build_ptr_query(id: u16, services: &[&str]) -> Vec<u8> {
    let services = &services[..services.len().min(8)];
    let mut packet = Vec::with_capacity(12 + services.len() * 34);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // flags: standard query
    packet.extend_from_slice(&(services.len() as u16).to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    for service in services {
        encode_name(service, &mut packet);
        packet.extend_from_slice(&TYPE_PTR.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    }
    packet
}

/// Decode a possibly-compressed name starting at `pos`. Returns the name and
/// the position after the name's in-line representation.
fn decode_name(data: &[u8], pos: usize) -> Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut cursor = pos;
    let mut jumped_end = None;
    let mut hops = 0;

    loop {
        if cursor >= data.len() {
            bail!("name runs past end of message");
        }
        let len = data[cursor] as usize;
        if len == 0 {
            cursor += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            if cursor + 1 >= data.len() {
                bail!("truncated compression pointer");
            }
            let target = (((len & 0x3F) as usize) << 8) | data[cursor + 1] as usize;
            if jumped_end.is_none() {
                jumped_end = Some(cursor + 2);
            }
            hops += 1;
            if hops > 32 {
                bail!("compression pointer loop");
            }
            cursor = target;
            continue;
        }
        if cursor + 1 + len > data.len() {
            bail!("label runs past end of message");
        }
        labels.push(String::from_utf8_lossy(&data[cursor + 1..cursor + 1 + len]).to_string());
        cursor += 1 + len;
    }

    Ok((labels.join("."), jumped_end.unwrap_or(cursor)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt(Vec<String>),
    A(Ipv4Addr),
    Other(u16),
}

#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub data: RecordData,
}

#[derive(Debug, Default)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub records: Vec<Record>,
}

pub fn parse_message(data: &[u8]) -> Result<DnsMessage> {
    let mut header = ByteReader::new(data);
    let id = header.u16_be()?;
    let flags = header.u16_be()?;
    let qdcount = header.u16_be()? as usize;
    let ancount = header.u16_be()? as usize;
    let nscount = header.u16_be()? as usize;
    let arcount = header.u16_be()? as usize;

    let mut message = DnsMessage {
        id,
        is_response: flags & 0x8000 != 0,
        records: Vec::new(),
    };

    let mut pos = 12;
    for _ in 0..qdcount {
        let (_, after) = decode_name(data, pos)?;
        pos = after + 4;
    }

    for _ in 0..ancount + nscount + arcount {
        if pos >= data.len() {
            break;
        }
        let (name, after) = decode_name(data, pos)?;
        let mut fixed = ByteReader::new(data);
        fixed.seek(after)?;
        let rtype = fixed.u16_be()?;
        let _class = fixed.u16_be()?;
        let _ttl = fixed.u32_be()?;
        let rdlength = fixed.u16_be()? as usize;
        let rdata_pos = fixed.position();
        if rdata_pos + rdlength > data.len() {
            break;
        }

        let record_data = match rtype {
            TYPE_PTR => decode_name(data, rdata_pos).map(|(n, _)| RecordData::Ptr(n))?,
            TYPE_SRV => {
                let mut srv = ByteReader::new(data);
                srv.seek(rdata_pos)?;
                let priority = srv.u16_be()?;
                let weight = srv.u16_be()?;
                let port = srv.u16_be()?;
                let (target, _) = decode_name(data, srv.position())?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            TYPE_TXT => {
                let mut entries = Vec::new();
                let mut txt = ByteReader::new(&data[rdata_pos..rdata_pos + rdlength]);
                while txt.remaining() > 0 {
                    let len = txt.u8()? as usize;
                    let chunk = txt.take(len.min(txt.remaining()))?;
                    if !chunk.is_empty() {
                        entries.push(String::from_utf8_lossy(chunk).to_string());
                    }
                }
                RecordData::Txt(entries)
            }
            TYPE_A if rdlength == 4 => {
                let b = &data[rdata_pos..rdata_pos + 4];
                RecordData::A(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            other => RecordData::Other(other),
        };

        message.records.push(Record {
            name,
            data: record_data,
        });
        pos = rdata_pos + rdlength;
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_name(out: &mut Vec<u8>, name: &str) {
        encode_name(name, out);
    }

    #[test]
    fn query_has_one_question_per_service() {
        let packet = build_ptr_query(0x1234, &["_ipp._tcp.local", "_airplay._tcp.local"]);
        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 2);
        let parsed = parse_message(&packet).unwrap();
        assert!(!parsed.is_response);
        assert!(parsed.records.is_empty());
    }

    #[test]
    fn question_count_capped_at_eight() {
        let names = vec!["_x._tcp.local"; 12];
        let packet = build_ptr_query(1, &names);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 8);
    }

    #[test]
    fn response_with_compression_parses() {
        // Hand-built response: one PTR answer whose rdata points back at a
        // name in the question section, plus SRV/TXT/A records.
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x00_01u16.to_be_bytes()); // id
        msg.extend_from_slice(&0x8400u16.to_be_bytes()); // response flags
        msg.extend_from_slice(&1u16.to_be_bytes()); // qd
        msg.extend_from_slice(&4u16.to_be_bytes()); // an
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());

        let question_name_at = msg.len();
        write_name(&mut msg, "_ipp._tcp.local");
        msg.extend_from_slice(&TYPE_PTR.to_be_bytes());
        msg.extend_from_slice(&CLASS_IN.to_be_bytes());

        // PTR answer: name = pointer to question name, rdata = "Printer" +
        // pointer to question name
        let ptr_to_question = 0xC000u16 | question_name_at as u16;
        msg.extend_from_slice(&ptr_to_question.to_be_bytes());
        msg.extend_from_slice(&TYPE_PTR.to_be_bytes());
        msg.extend_from_slice(&CLASS_IN.to_be_bytes());
        msg.extend_from_slice(&120u32.to_be_bytes());
        let rdata = {
            let mut r = Vec::new();
            r.push(7);
            r.extend_from_slice(b"Printer");
            r.extend_from_slice(&ptr_to_question.to_be_bytes());
            r
        };
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        let instance_name_at = msg.len();
        msg.extend_from_slice(&rdata);

        // SRV answer on the instance name
        let ptr_to_instance = 0xC000u16 | instance_name_at as u16;
        msg.extend_from_slice(&ptr_to_instance.to_be_bytes());
        msg.extend_from_slice(&TYPE_SRV.to_be_bytes());
        msg.extend_from_slice(&CLASS_IN.to_be_bytes());
        msg.extend_from_slice(&120u32.to_be_bytes());
        let mut srv_rdata = Vec::new();
        srv_rdata.extend_from_slice(&0u16.to_be_bytes());
        srv_rdata.extend_from_slice(&0u16.to_be_bytes());
        srv_rdata.extend_from_slice(&631u16.to_be_bytes());
        write_name(&mut srv_rdata, "printer.local");
        msg.extend_from_slice(&(srv_rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(&srv_rdata);

        // TXT answer
        msg.extend_from_slice(&ptr_to_instance.to_be_bytes());
        msg.extend_from_slice(&TYPE_TXT.to_be_bytes());
        msg.extend_from_slice(&CLASS_IN.to_be_bytes());
        msg.extend_from_slice(&120u32.to_be_bytes());
        let txt_rdata = {
            let mut r = Vec::new();
            r.push(6);
            r.extend_from_slice(b"rp=ipp");
            r.push(9);
            r.extend_from_slice(b"ty=HP LJ4");
            r
        };
        msg.extend_from_slice(&(txt_rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(&txt_rdata);

        // A answer
        write_name(&mut msg, "printer.local");
        msg.extend_from_slice(&TYPE_A.to_be_bytes());
        msg.extend_from_slice(&CLASS_IN.to_be_bytes());
        msg.extend_from_slice(&120u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[192, 168, 1, 50]);

        let parsed = parse_message(&msg).unwrap();
        assert!(parsed.is_response);
        assert_eq!(parsed.records.len(), 4);

        assert_eq!(parsed.records[0].name, "_ipp._tcp.local");
        assert_eq!(
            parsed.records[0].data,
            RecordData::Ptr("Printer._ipp._tcp.local".to_string())
        );
        match &parsed.records[1].data {
            RecordData::Srv { port, target, .. } => {
                assert_eq!(*port, 631);
                assert_eq!(target, "printer.local");
            }
            other => panic!("expected SRV, got {other:?}"),
        }
        assert_eq!(
            parsed.records[2].data,
            RecordData::Txt(vec!["rp=ipp".to_string(), "ty=HP LJ4".to_string()])
        );
        assert_eq!(
            parsed.records[3].data,
            RecordData::A(Ipv4Addr::new(192, 168, 1, 50))
        );
    }

    #[test]
    fn pointer_loop_detected() {
        let mut msg = vec![0u8; 12];
        msg[5] = 0; // qdcount 0
        msg[7] = 1; // ancount 1
        // name is a pointer to itself
        msg.extend_from_slice(&[0xC0, 12]);
        assert!(parse_message(&msg).is_err());
    }
}
