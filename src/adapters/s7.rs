//! S7comm identification: COTP connection, S7 setup communication, then
//! pipelined SZL reads until CPU model and order number are known. Rack and
//! slot are discovered by trying the common combinations in priority order.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::util::{ByteReader, clean_text, tcp_connect};
use super::{Adapter, AdapterFactory, Metric, ProbeOptions, create_adapter};

const RACK_SLOT_ATTEMPTS: &[(u8, u8)] = &[(0, 2), (0, 0), (0, 1)];
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const NEGOTIATED_PDU_REQUEST: u16 = 480;

/// SZL identifiers probed, in order, for identification records.
const SZL_READS: &[(u16, u16)] = &[
    (0x0011, 0x0000),
    (0x001C, 0x0000),
    (0x001C, 0x0001),
    (0x001C, 0x0006),
    (0x0131, 0x0001),
];

fn tpkt(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x03, 0x00];
    out.extend_from_slice(&((payload.len() + 4) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// COTP Connection Request addressed at one rack/slot.
pub fn cotp_connect_request(rack: u8, slot: u8) -> Vec<u8> {
    let remote_tsap = (rack << 5) | (slot & 0x1F);
    let cotp = vec![
        0x11, // length
        0xE0, // CR
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // source TSAP
        0xC2, 0x02, 0x01, remote_tsap, // destination TSAP
    ];
    tpkt(&cotp)
}

fn cotp_data(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x02, 0xF0, 0x80];
    out.extend_from_slice(payload);
    tpkt(&out)
}

/// S7 Setup Communication job.
pub fn setup_communication(pdu_ref: u16) -> Vec<u8> {
    let mut s7 = vec![0x32, 0x01, 0x00, 0x00];
    s7.extend_from_slice(&pdu_ref.to_be_bytes());
    s7.extend_from_slice(&8u16.to_be_bytes()); // parameter length
    s7.extend_from_slice(&0u16.to_be_bytes()); // data length
    s7.extend_from_slice(&[0xF0, 0x00]);
    s7.extend_from_slice(&1u16.to_be_bytes()); // max AMQ caller
    s7.extend_from_slice(&1u16.to_be_bytes()); // max AMQ callee
    s7.extend_from_slice(&NEGOTIATED_PDU_REQUEST.to_be_bytes());
    cotp_data(&s7)
}

/// SZL read request (userdata, CPU functions group).
pub fn szl_request(pdu_ref: u16, szl_id: u16, index: u16) -> Vec<u8> {
    let mut s7 = vec![0x32, 0x07, 0x00, 0x00];
    s7.extend_from_slice(&pdu_ref.to_be_bytes());
    s7.extend_from_slice(&8u16.to_be_bytes()); // parameter length
    s7.extend_from_slice(&8u16.to_be_bytes()); // data length
    // Userdata parameter: request, function group 4 (CPU), subfunction 1
    s7.extend_from_slice(&[0x00, 0x01, 0x12, 0x04, 0x11, 0x44, 0x01, 0x00]);
    // Data: success, octet-string transport, SZL id + index
    s7.extend_from_slice(&[0xFF, 0x09]);
    s7.extend_from_slice(&4u16.to_be_bytes());
    s7.extend_from_slice(&szl_id.to_be_bytes());
    s7.extend_from_slice(&index.to_be_bytes());
    cotp_data(&s7)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SzlRecord {
    pub index: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SzlResponse {
    pub szl_id: u16,
    pub records: Vec<SzlRecord>,
}

/// Decode the S7 part of an SZL read answer (TPKT/COTP already stripped).
pub fn parse_szl_response(s7: &[u8]) -> Result<SzlResponse> {
    let mut reader = ByteReader::new(s7);
    if reader.u8()? != 0x32 {
        bail!("not an S7 frame");
    }
    let rosctr = reader.u8()?;
    if rosctr != 0x07 {
        bail!("ROSCTR {} is not userdata", rosctr);
    }
    reader.skip(2)?; // reserved
    reader.skip(2)?; // pdu ref
    let param_len = reader.u16_be()? as usize;
    let data_len = reader.u16_be()? as usize;
    reader.skip(param_len)?;
    if data_len < 8 {
        bail!("userdata data section too short");
    }
    let return_code = reader.u8()?;
    if return_code != 0xFF {
        bail!("SZL read failed with return code {:#04x}", return_code);
    }
    reader.skip(1)?; // transport size
    let length = reader.u16_be()? as usize;
    if length < 8 {
        bail!("SZL payload too short");
    }
    let szl_id = reader.u16_be()?;
    let _index = reader.u16_be()?;
    let record_length = reader.u16_be()? as usize;
    let record_count = reader.u16_be()? as usize;

    let mut response = SzlResponse {
        szl_id,
        records: Vec::new(),
    };
    for _ in 0..record_count.min(64) {
        if record_length < 2 || reader.remaining() < record_length {
            break;
        }
        let index = reader.u16_be()?;
        let payload = reader.take(record_length - 2)?.to_vec();
        response.records.push(SzlRecord { index, payload });
    }
    Ok(response)
}

#[derive(Debug, Default)]
pub struct CpuIdentity {
    pub module: Option<String>,
    pub order_number: Option<String>,
    pub module_name: Option<String>,
    pub plant_id: Option<String>,
    pub firmware: Option<String>,
}

/// Fold one SZL answer into the identity. 0x0011 carries order numbers,
/// 0x001C component names.
pub fn absorb_szl(identity: &mut CpuIdentity, response: &SzlResponse) {
    match response.szl_id & 0x00FF {
        0x11 => {
            for record in &response.records {
                let text = clean_text(&record.payload[..record.payload.len().min(20)]);
                if text.is_empty() {
                    continue;
                }
                match record.index {
                    0x0001 => identity.order_number = Some(text),
                    0x0006 => {
                        if identity.order_number.is_none() {
                            identity.order_number = Some(text);
                        }
                    }
                    0x0007 => identity.firmware = Some(text),
                    _ => {}
                }
            }
        }
        0x1C => {
            for record in &response.records {
                let text = clean_text(&record.payload);
                if text.is_empty() {
                    continue;
                }
                match record.index {
                    0x0001 => identity.module_name = Some(text),
                    0x0002 => identity.module = Some(text),
                    0x0003 => identity.plant_id = Some(text),
                    0x0006 => {
                        if identity.module.is_none() {
                            identity.module = Some(text);
                        }
                    }
                    _ => {}
                }
            }
        }
        0x31 => {
            // Communication capabilities; nothing identifying, presence only.
        }
        _ => {}
    }
}

struct S7Session {
    stream: TcpStream,
    pdu_ref: u16,
}

impl S7Session {
    async fn read_tpkt(&mut self, step: Duration) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        timeout(step, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| anyhow!("timed out"))??;
        if header[0] != 0x03 {
            bail!("not a TPKT header");
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < 4 || total > 8192 {
            bail!("implausible TPKT length {}", total);
        }
        let mut body = vec![0u8; total - 4];
        timeout(step, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| anyhow!("timed out"))??;
        Ok(body)
    }

    /// Connect at one rack/slot; Err at any step closes the attempt.
    async fn open(
        host: Ipv4Addr,
        port: u16,
        rack: u8,
        slot: u8,
        step: Duration,
    ) -> Result<Self> {
        let stream = tcp_connect(host, port, step).await?;
        let mut session = Self { stream, pdu_ref: 1 };

        session
            .stream
            .write_all(&cotp_connect_request(rack, slot))
            .await?;
        let confirm = session.read_tpkt(step).await?;
        if confirm.len() < 2 || confirm[1] != COTP_CONNECT_CONFIRM {
            bail!("COTP connection refused for rack {} slot {}", rack, slot);
        }

        session.stream.write_all(&setup_communication(1)).await?;
        let setup = session.read_tpkt(step).await?;
        // COTP data header (3) + S7 header; ack-data carries ROSCTR 0x03
        if setup.len() < 5 || setup[3] != 0x32 || setup[4] != 0x03 {
            bail!("setup communication not acknowledged");
        }

        Ok(session)
    }

    async fn read_szl(&mut self, szl_id: u16, index: u16, step: Duration) -> Result<SzlResponse> {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.stream
            .write_all(&szl_request(self.pdu_ref, szl_id, index))
            .await?;
        let body = self.read_tpkt(step).await?;
        if body.len() < 4 {
            bail!("short SZL answer");
        }
        parse_szl_response(&body[3..])
    }
}

#[derive(Default)]
pub struct S7Adapter;

#[async_trait]
impl Adapter for S7Adapter {
    fn name(&self) -> &'static str {
        "s7"
    }

    fn service_labels(&self) -> &'static [&'static str] {
        &["s7", "s7comm", "iso-tsap"]
    }

    fn default_port(&self) -> u16 {
        102
    }

    async fn discover(&self, host: Ipv4Addr, port: u16, options: &ProbeOptions) -> Vec<Metric> {
        let step = options.slice(0.15).max(Duration::from_millis(500));

        let mut session = None;
        let mut attempt_count = 0usize;
        let mut found_rack_slot = (0u8, 0u8);
        for &(rack, slot) in RACK_SLOT_ATTEMPTS {
            if options.remaining().is_zero() {
                break;
            }
            attempt_count += 1;
            match S7Session::open(host, port, rack, slot, step).await {
                Ok(opened) => {
                    found_rack_slot = (rack, slot);
                    session = Some(opened);
                    break;
                }
                Err(e) => {
                    tracing::trace!("s7 {}:{} rack {}/{} - {}", host, port, rack, slot, e)
                }
            }
        }
        let Some(mut session) = session else {
            return Vec::new();
        };

        let mut identity = CpuIdentity::default();
        let mut szl_ids_answered = Vec::new();
        for &(szl_id, index) in SZL_READS {
            if options.remaining().is_zero() {
                break;
            }
            match session.read_szl(szl_id, index, step).await {
                Ok(response) => {
                    szl_ids_answered.push(format!("{szl_id:#06x}"));
                    absorb_szl(&mut identity, &response);
                }
                Err(e) => tracing::trace!("s7 {}:{} szl {:#06x} - {}", host, port, szl_id, e),
            }
            if identity.module.is_some() && identity.order_number.is_some() {
                break;
            }
        }

        if szl_ids_answered.is_empty() {
            // The CPU accepted the session; report connectivity only.
            return vec![
                Metric::new("s7")
                    .tag("port", &port.to_string())
                    .field("rack", found_rack_slot.0 as i64)
                    .field("slot", found_rack_slot.1 as i64)
                    .field("attempt_count", attempt_count as i64),
            ];
        }

        vec![
            Metric::new("s7")
                .tag("port", &port.to_string())
                .field("rack", found_rack_slot.0 as i64)
                .field("slot", found_rack_slot.1 as i64)
                .field("attempt_count", attempt_count as i64)
                .field("szl_lists", szl_ids_answered.join(","))
                .field_opt("module", identity.module.as_deref())
                .field_opt("order_number", identity.order_number.as_deref())
                .field_opt("module_name", identity.module_name.as_deref())
                .field_opt("plant_id", identity.plant_id.as_deref())
                .field_opt("firmware", identity.firmware.as_deref()),
        ]
    }
}

inventory::submit!(AdapterFactory::new(create_adapter::<S7Adapter>));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_encodes_rack_and_slot_in_tsap() {
        let frame = cotp_connect_request(0, 2);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(frame[5], 0xE0);
        assert_eq!(*frame.last().unwrap(), 0x02);

        let frame = cotp_connect_request(1, 3);
        assert_eq!(*frame.last().unwrap(), (1 << 5) | 3);
    }

    #[test]
    fn setup_frame_requests_480_byte_pdus() {
        let frame = setup_communication(1);
        assert_eq!(&frame[frame.len() - 2..], &NEGOTIATED_PDU_REQUEST.to_be_bytes());
        // TPKT + COTP DT + S7 header present
        assert_eq!(frame[0], 0x03);
        assert_eq!(frame[4], 0x02);
        assert_eq!(frame[7], 0x32);
    }

    fn szl_answer(szl_id: u16, records: &[(u16, &[u8])]) -> Vec<u8> {
        let record_length = records.first().map(|(_, p)| p.len() + 2).unwrap_or(2);
        let mut szl = Vec::new();
        szl.extend_from_slice(&szl_id.to_be_bytes());
        szl.extend_from_slice(&0u16.to_be_bytes());
        szl.extend_from_slice(&(record_length as u16).to_be_bytes());
        szl.extend_from_slice(&(records.len() as u16).to_be_bytes());
        for (index, payload) in records {
            szl.extend_from_slice(&index.to_be_bytes());
            szl.extend_from_slice(payload);
        }

        let mut s7 = vec![0x32, 0x07, 0x00, 0x00, 0x00, 0x02];
        s7.extend_from_slice(&12u16.to_be_bytes()); // parameter length
        s7.extend_from_slice(&((szl.len() + 4) as u16).to_be_bytes());
        s7.extend_from_slice(&[0x00, 0x01, 0x12, 0x08, 0x12, 0x84, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
        s7.extend_from_slice(&[0xFF, 0x09]);
        s7.extend_from_slice(&((szl.len()) as u16).to_be_bytes());
        s7.extend_from_slice(&szl);
        s7
    }

    #[test]
    fn szl_module_identification_parses() {
        let mut order = b"6ES7 315-2EH14-0AB0 ".to_vec();
        order.extend_from_slice(&[0x00, 0xC0, 0x00, 0x01, 0x00, 0x01]);
        let answer = szl_answer(0x0011, &[(0x0001, &order)]);
        let response = parse_szl_response(&answer).unwrap();
        assert_eq!(response.szl_id, 0x0011);
        assert_eq!(response.records.len(), 1);

        let mut identity = CpuIdentity::default();
        absorb_szl(&mut identity, &response);
        assert_eq!(identity.order_number.as_deref(), Some("6ES7 315-2EH14-0AB0"));
    }

    #[test]
    fn szl_component_names_parse() {
        let mut name = b"CPU 315-2 PN/DP".to_vec();
        name.resize(32, 0);
        let answer = szl_answer(0x001C, &[(0x0002, &name)]);
        let mut identity = CpuIdentity::default();
        absorb_szl(&mut identity, &parse_szl_response(&answer).unwrap());
        assert_eq!(identity.module.as_deref(), Some("CPU 315-2 PN/DP"));
    }

    #[test]
    fn szl_failure_return_code_is_error() {
        let mut answer = szl_answer(0x0011, &[]);
        // Flip the data return code to "object does not exist"
        let data_start = answer.len() - 12;
        assert_eq!(answer[data_start], 0xFF);
        answer[data_start] = 0x0A;
        assert!(parse_szl_response(&answer).is_err());
    }

    #[test]
    fn malformed_frames_never_panic() {
        for cut in 0..20 {
            let answer = szl_answer(0x0011, &[(1, &[0u8; 26])]);
            let _ = parse_szl_response(&answer[..cut.min(answer.len())]);
        }
        assert!(parse_szl_response(&[0x99, 0x07]).is_err());
    }

    #[tokio::test]
    async fn rack_slot_fallback_against_local_fixture() {
        use tokio::net::TcpListener;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Fixture PLC: refuses TSAP for slot 2, accepts slot 0, answers one
        // SZL list.
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    let slot = buf[n - 1] & 0x1F;
                    if slot != 0 {
                        // Refuse: close without a connect confirm
                        return;
                    }
                    let confirm = vec![0x03, 0x00, 0x00, 0x0B, 0x06, 0xD0, 0x00, 0x01, 0x00, 0x00, 0x00];
                    stream.write_all(&confirm).await.unwrap();

                    // Setup communication ack
                    let _ = stream.read(&mut buf).await;
                    let mut ack = vec![0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, 0x00, 0x01];
                    ack.extend_from_slice(&8u16.to_be_bytes());
                    ack.extend_from_slice(&0u16.to_be_bytes());
                    ack.extend_from_slice(&[0x00, 0x00]); // error class/code
                    ack.extend_from_slice(&[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0]);
                    let mut framed = vec![0x03, 0x00];
                    framed.extend_from_slice(&((ack.len() + 4) as u16).to_be_bytes());
                    framed.extend_from_slice(&ack);
                    stream.write_all(&framed).await.unwrap();

                    // Answer every SZL request with a module name list
                    loop {
                        let Ok(n) = stream.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        let mut name = b"CPU 1212C".to_vec();
                        name.resize(32, 0);
                        let s7 = szl_answer(0x001C, &[(0x0002, &name)]);
                        let mut body = vec![0x02, 0xF0, 0x80];
                        body.extend_from_slice(&s7);
                        let mut framed = vec![0x03, 0x00];
                        framed.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
                        framed.extend_from_slice(&body);
                        if stream.write_all(&framed).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let options = ProbeOptions::with_timeout(Duration::from_secs(5));
        let metrics = S7Adapter
            .discover(Ipv4Addr::new(127, 0, 0, 1), port, &options)
            .await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].fields["rack"], 0);
        assert_eq!(metrics[0].fields["slot"], 0);
        assert_eq!(metrics[0].fields["attempt_count"], 2);
        assert_eq!(metrics[0].fields["module"], "CPU 1212C");
    }
}
