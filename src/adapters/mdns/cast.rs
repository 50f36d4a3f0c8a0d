//! HTTP enrichment for cast devices found over mDNS: the Chromecast setup
//! endpoint on 8008/8443 and the AirPlay /info endpoint on 7000/5000, whose
//! reply is a binary property list.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::adapters::util::ByteReader;

const CHROMECAST_FIELDS: &[&str] = &[
    "name",
    "model_name",
    "manufacturer",
    "cast_build_revision",
    "mac_address",
    "ssid",
    "uptime",
];

const AIRPLAY_FIELDS: &[&str] = &[
    "name",
    "model",
    "deviceid",
    "macAddress",
    "features",
    "srcvers",
    "osVersion",
    "firmwareRevision",
    "manufacturer",
];

/// Fetch Chromecast device details: plain HTTP first, then the TLS variant.
pub async fn chromecast_info(host: Ipv4Addr, budget: Duration) -> Option<Value> {
    let client = reqwest::Client::builder()
        .timeout(budget)
        .danger_accept_invalid_certs(true)
        .build()
        .ok()?;

    for url in [
        format!("http://{host}:8008/setup/eureka_info?options=detail"),
        format!("https://{host}:8443/setup/eureka_info?options=detail"),
    ] {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                if let Ok(json) = response.json::<Value>().await {
                    let mut out = serde_json::Map::new();
                    for field in CHROMECAST_FIELDS {
                        if let Some(v) = json.get(*field) {
                            if !v.is_null() {
                                out.insert(format!("cast_{field}"), v.clone());
                            }
                        }
                    }
                    if !out.is_empty() {
                        return Some(Value::Object(out));
                    }
                }
            }
            Ok(_) | Err(_) => continue,
        }
    }
    None
}

/// Fetch AirPlay receiver details; the /info body is a binary plist.
pub async fn airplay_info(host: Ipv4Addr, budget: Duration) -> Option<Value> {
    let client = reqwest::Client::builder().timeout(budget).build().ok()?;

    for port in [7000u16, 5000] {
        let url = format!("http://{host}:{port}/info");
        match client
            .get(&url)
            .header("X-Apple-ProtocolVersion", "1")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let Ok(body) = response.bytes().await else {
                    continue;
                };
                if let Ok(plist) = parse_bplist(&body) {
                    let mut out = serde_json::Map::new();
                    for field in AIRPLAY_FIELDS {
                        if let Some(v) = plist.get(*field) {
                            if !v.is_null() {
                                out.insert(format!("airplay_{field}"), v.clone());
                            }
                        }
                    }
                    if !out.is_empty() {
                        return Some(Value::Object(out));
                    }
                }
            }
            Ok(_) | Err(_) => continue,
        }
    }
    None
}

/// Minimal binary-plist reader covering the object kinds AirPlay /info
/// replies actually contain. Never panics on malformed input.
pub fn parse_bplist(data: &[u8]) -> Result<Value> {
    if data.len() < 40 || &data[..8] != b"bplist00" {
        bail!("not a binary plist");
    }

    let trailer = &data[data.len() - 32..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap()) as usize;
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().unwrap()) as usize;
    let table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap()) as usize;

    if offset_size == 0 || offset_size > 8 || ref_size == 0 || ref_size > 8 {
        bail!("implausible plist trailer");
    }
    if num_objects == 0 || num_objects > 100_000 {
        bail!("implausible object count");
    }
    if table_offset + num_objects * offset_size > data.len() {
        bail!("offset table runs past end");
    }

    let read_sized = |raw: &[u8]| -> u64 {
        raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    };

    let offsets: Vec<usize> = (0..num_objects)
        .map(|i| {
            let at = table_offset + i * offset_size;
            read_sized(&data[at..at + offset_size]) as usize
        })
        .collect();

    fn read_object(
        data: &[u8],
        offsets: &[usize],
        ref_size: usize,
        index: usize,
        depth: usize,
    ) -> Result<Value> {
        if depth > 16 {
            bail!("plist nesting too deep");
        }
        let offset = *offsets.get(index).ok_or_else(|| anyhow::anyhow!("object ref out of range"))?;
        let mut reader = ByteReader::new(data);
        reader.seek(offset)?;
        let marker = reader.u8()?;
        let kind = marker >> 4;
        let low = (marker & 0x0F) as usize;

        let read_length = |reader: &mut ByteReader| -> Result<usize> {
            if low != 0x0F {
                return Ok(low);
            }
            let int_marker = reader.u8()?;
            if int_marker >> 4 != 0x1 {
                bail!("length marker is not an integer");
            }
            let bytes = 1usize << (int_marker & 0x0F);
            let raw = reader.take(bytes)?;
            Ok(raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
        };

        match kind {
            0x0 => match marker {
                0x00 => Ok(Value::Null),
                0x08 => Ok(Value::Bool(false)),
                0x09 => Ok(Value::Bool(true)),
                _ => Ok(Value::Null),
            },
            0x1 => {
                let bytes = 1usize << low;
                let raw = reader.take(bytes)?;
                Ok(Value::from(
                    raw.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64),
                ))
            }
            0x2 => {
                let bytes = 1usize << low;
                let raw = reader.take(bytes)?;
                let real = match bytes {
                    4 => f32::from_be_bytes(raw.try_into().unwrap()) as f64,
                    8 => f64::from_be_bytes(raw.try_into().unwrap()),
                    _ => bail!("unsupported real width"),
                };
                Ok(Value::from(real))
            }
            0x4 => {
                let len = read_length(&mut reader)?;
                let raw = reader.take(len)?;
                // Opaque data is surfaced as hex
                Ok(Value::String(
                    raw.iter().map(|b| format!("{b:02x}")).collect(),
                ))
            }
            0x5 => {
                let len = read_length(&mut reader)?;
                let raw = reader.take(len)?;
                Ok(Value::String(String::from_utf8_lossy(raw).to_string()))
            }
            0x6 => {
                let len = read_length(&mut reader)?;
                let raw = reader.take(len * 2)?;
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Value::String(String::from_utf16_lossy(&units)))
            }
            0xA => {
                let len = read_length(&mut reader)?;
                let refs = reader.take(len * ref_size)?;
                let mut array = Vec::with_capacity(len);
                for chunk in refs.chunks_exact(ref_size) {
                    let child = chunk.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
                    array.push(read_object(data, offsets, ref_size, child, depth + 1)?);
                }
                Ok(Value::Array(array))
            }
            0xD => {
                let len = read_length(&mut reader)?;
                let key_refs = reader.take(len * ref_size)?.to_vec();
                let value_refs = reader.take(len * ref_size)?.to_vec();
                let mut map = serde_json::Map::new();
                for (key_chunk, value_chunk) in key_refs
                    .chunks_exact(ref_size)
                    .zip(value_refs.chunks_exact(ref_size))
                {
                    let key_index =
                        key_chunk.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
                    let value_index =
                        value_chunk.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
                    let key = match read_object(data, offsets, ref_size, key_index, depth + 1)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    map.insert(
                        key,
                        read_object(data, offsets, ref_size, value_index, depth + 1)?,
                    );
                }
                Ok(Value::Object(map))
            }
            _ => Ok(Value::Null),
        }
    }

    read_object(data, &offsets, ref_size, top_object, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a bplist by hand: {"model": "AppleTV6,2", "features": 0x4A7FDFD5,
    /// "pw": false}
    fn airplay_fixture() -> Vec<u8> {
        let mut data: Vec<u8> = b"bplist00".to_vec();
        let mut offsets = Vec::new();

        // 0: dict with 3 entries, keys 1..=3, values 4..=6
        offsets.push(data.len());
        data.push(0xD3);
        data.extend_from_slice(&[1, 2, 3]); // key refs
        data.extend_from_slice(&[4, 5, 6]); // value refs

        for key in ["model", "features", "pw"] {
            offsets.push(data.len());
            data.push(0x50 | key.len() as u8);
            data.extend_from_slice(key.as_bytes());
        }

        // value 4: ascii string
        offsets.push(data.len());
        let model = "AppleTV6,2";
        data.push(0x5F); // string, length follows
        data.push(0x10); // int, 1 byte
        data.push(model.len() as u8);
        data.extend_from_slice(model.as_bytes());

        // value 5: 4-byte int
        offsets.push(data.len());
        data.push(0x12);
        data.extend_from_slice(&0x4A7F_DFD5u32.to_be_bytes());

        // value 6: false
        offsets.push(data.len());
        data.push(0x08);

        let table_offset = data.len();
        for offset in &offsets {
            data.push(*offset as u8);
        }

        // trailer
        data.extend_from_slice(&[0u8; 6]);
        data.push(1); // offset size
        data.push(1); // ref size
        data.extend_from_slice(&(offsets.len() as u64).to_be_bytes());
        data.extend_from_slice(&0u64.to_be_bytes()); // top object
        data.extend_from_slice(&(table_offset as u64).to_be_bytes());
        data
    }

    #[test]
    fn bplist_dict_round_trip() {
        let value = parse_bplist(&airplay_fixture()).unwrap();
        assert_eq!(value["model"], "AppleTV6,2");
        assert_eq!(value["features"], 0x4A7F_DFD5i64);
        assert_eq!(value["pw"], false);
    }

    #[test]
    fn bplist_rejects_garbage() {
        assert!(parse_bplist(b"not a plist").is_err());
        assert!(parse_bplist(b"bplist00").is_err());
        // Corrupted trailer
        let mut fixture = airplay_fixture();
        let len = fixture.len();
        fixture[len - 25] = 0xFF;
        assert!(parse_bplist(&fixture).is_err());
    }

    #[test]
    fn bplist_never_panics_on_truncation() {
        let fixture = airplay_fixture();
        for cut in 0..fixture.len() {
            let _ = parse_bplist(&fixture[..cut]);
        }
    }
}
