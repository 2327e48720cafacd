//! PROXY protocol v1 framing.
//!
//! Parses the single ASCII header line a peer proxy prepends to a TCP
//! connection, and formats the line we prepend on egress.
//!
//! Wire format (from the HAProxy PROXY protocol spec):
//!
//! ```text
//! PROXY TCP4 <src-ip> <dst-ip> <src-port> <dst-port>\r\n
//! ```
//!
//! Only TCP4 carries addresses here. `PROXY UNKNOWN\r\n` is recognized but
//! yields no framing; TCP6 is not supported and also yields no framing.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest valid v1 header line, terminator included.
const MAX_HEADER_LEN: usize = 107;

const HEADER_PREFIX: &[u8] = b"PROXY ";

/// Errors produced while parsing a header line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The line does not have the `PROXY <proto> <fields>` shape.
    #[error("malformed header line: {0}")]
    Malformed(String),

    /// The inet protocol token is not `TCP4`.
    #[error("unsupported inet protocol: {0}")]
    UnsupportedProtocol(String),

    /// An address field failed IPv4 validation.
    #[error("invalid address: {0}")]
    BadAddress(String),

    /// A port field is not a decimal in 1..=65535.
    #[error("invalid port: {0}")]
    BadPort(String),
}

/// A parsed (or synthesized) TCP4 header.
///
/// `dst_port` doubles as the proxy-port routing key on the control listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyV1Header {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ProxyV1Header {
    /// Header announced for clients that did not send their own framing:
    /// loopback addresses with the cluster port in both port fields.
    pub fn synthesized(cluster_port: u16) -> Self {
        Self {
            src_ip: Ipv4Addr::LOCALHOST,
            dst_ip: Ipv4Addr::LOCALHOST,
            src_port: cluster_port,
            dst_port: cluster_port,
        }
    }

    /// Parse one header line, without the trailing CRLF.
    pub fn parse_line(line: &str) -> Result<Self, HeaderError> {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 6 || fields[0] != "PROXY" {
            return Err(HeaderError::Malformed(line.to_string()));
        }
        if fields[1] != "TCP4" {
            return Err(HeaderError::UnsupportedProtocol(fields[1].to_string()));
        }

        let src_ip = parse_ipv4(fields[2])?;
        let dst_ip = parse_ipv4(fields[3])?;
        let src_port = parse_port(fields[4])?;
        let dst_port = parse_port(fields[5])?;

        Ok(Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        })
    }

    /// Format the header line for egress, CRLF included.
    pub fn format(&self) -> String {
        format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            self.src_ip, self.dst_ip, self.src_port, self.dst_port
        )
    }
}

fn parse_ipv4(field: &str) -> Result<Ipv4Addr, HeaderError> {
    field
        .parse()
        .map_err(|_| HeaderError::BadAddress(field.to_string()))
}

fn parse_port(field: &str) -> Result<u16, HeaderError> {
    match field.parse::<u16>() {
        Ok(0) | Err(_) => Err(HeaderError::BadPort(field.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Outcome of reading the framing from a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// A valid TCP4 header was consumed.
    Framed(ProxyV1Header),
    /// No usable framing was found.
    Unframed,
}

/// Consume the PROXY framing from the front of a connection.
///
/// Returns the framing decision plus every byte read past it. For a framed
/// connection that is whatever followed the CRLF; for an unframed one it is
/// everything read so far, preserved so the caller can forward it as payload.
/// A `PROXY UNKNOWN` line is consumed but reported as unframed.
pub async fn read_framing<R>(stream: &mut R) -> io::Result<(Framing, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buffered: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];

    loop {
        // Stop reading as soon as the prefix cannot match; clients that never
        // send a header must not be stalled waiting for a CRLF.
        let probe = buffered.len().min(HEADER_PREFIX.len());
        if buffered[..probe] != HEADER_PREFIX[..probe] {
            return Ok((Framing::Unframed, buffered));
        }

        if let Some(pos) = find_crlf(&buffered) {
            let remainder = buffered[pos + 2..].to_vec();
            let line = match std::str::from_utf8(&buffered[..pos]) {
                Ok(line) => line,
                Err(_) => return Ok((Framing::Unframed, buffered)),
            };

            if line == "PROXY UNKNOWN" {
                return Ok((Framing::Unframed, remainder));
            }

            return match ProxyV1Header::parse_line(line) {
                Ok(header) => Ok((Framing::Framed(header), remainder)),
                Err(_) => Ok((Framing::Unframed, buffered)),
            };
        }

        if buffered.len() > MAX_HEADER_LEN {
            return Ok((Framing::Unframed, buffered));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok((Framing::Unframed, buffered));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

fn find_crlf(buffered: &[u8]) -> Option<usize> {
    buffered.windows(2).position(|window| window == b"\r\n")
}
