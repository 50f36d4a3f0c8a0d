//! Shared plumbing for the binary-protocol adapters: a bounds-checked byte
//! cursor, a UDP response collector with silence debounce, and small TCP
//! exchange helpers.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Bounds-checked big-endian-leaning cursor over a received frame.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            bail!("seek past end of frame");
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("frame truncated: wanted {} bytes, had {}", n, self.remaining());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn i32_le(&mut self) -> Result<i32> {
        Ok(self.u32_le()? as i32)
    }

    pub fn i64_le(&mut self) -> Result<i64> {
        Ok(self.u64_le()? as i64)
    }
}

/// Trim trailing NULs and whitespace from a fixed-width field and lossily
/// decode it.
pub fn clean_text(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&raw[..end]).to_string()
}

/// Collect UDP datagrams from `target` until `max_wait` elapses or the line
/// has been silent for `debounce` after at least one response. Datagrams
/// from other senders are ignored.
pub async fn collect_responses(
    socket: &UdpSocket,
    target: Ipv4Addr,
    max_wait: Duration,
    debounce: Duration,
) -> Vec<Vec<u8>> {
    let mut responses = Vec::new();
    let deadline = tokio::time::Instant::now() + max_wait;
    let mut buf = vec![0u8; 65536];

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let window = if responses.is_empty() {
            deadline - now
        } else {
            debounce.min(deadline - now)
        };

        match timeout(window, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from.ip() != std::net::IpAddr::V4(target) {
                    tracing::trace!("ignoring datagram from {} (probing {})", from, target);
                    continue;
                }
                responses.push(buf[..len].to_vec());
            }
            Ok(Err(e)) => {
                tracing::trace!("udp recv error while probing {}: {}", target, e);
                break;
            }
            Err(_) => break,
        }
    }

    responses
}

/// Bind an ephemeral UDP socket, send one datagram, return the socket for
/// response collection.
pub async fn send_udp(target: SocketAddr, payload: &[u8]) -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(payload, target).await?;
    Ok(socket)
}

/// One-shot UDP request/response with a single timeout.
pub async fn udp_exchange(
    target: SocketAddr,
    payload: &[u8],
    wait: Duration,
) -> Result<Option<Vec<u8>>> {
    let socket = send_udp(target, payload).await?;
    let mut buf = vec![0u8; 65536];
    loop {
        match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from.ip() != target.ip() {
                    continue;
                }
                return Ok(Some(buf[..len].to_vec()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(None),
        }
    }
}

pub async fn tcp_connect(ip: Ipv4Addr, port: u16, wait: Duration) -> Result<TcpStream> {
    let addr = SocketAddr::from((ip, port));
    Ok(timeout(wait, TcpStream::connect(addr)).await??)
}

/// Write a request then read until EOF, `cap` bytes, or the timeout, and
/// return what arrived.
pub async fn tcp_exchange_capped(
    stream: &mut TcpStream,
    request: &[u8],
    cap: usize,
    wait: Duration,
) -> Result<Vec<u8>> {
    stream.write_all(request).await?;
    let mut collected = Vec::with_capacity(cap.min(16 * 1024));
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + wait;

    while collected.len() < cap {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match timeout(deadline - now, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let room = cap - collected.len();
                collected.extend_from_slice(&buf[..n.min(room)]);
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
    Ok(collected)
}
