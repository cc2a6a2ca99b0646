//! CONNECT preamble spoken on the proxy socket.
//!
//! ```text
//! request:  0x01 | addr_type u8 | addr_len u16 LE | addr | port u16 LE
//! response: 0x02 | status u8    | bound_port u16 LE
//! ```
//!
//! `addr_type` is 0x01 (IPv4, 4 bytes), 0x04 (IPv6, 16 bytes) or 0x03
//! (domain name, UTF-8).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use kubetun_tunnel::TunnelError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MSG_CONNECT: u8 = 0x01;
const MSG_RESPONSE: u8 = 0x02;

/// Longest domain name accepted in a preamble.
const MAX_DOMAIN_LEN: usize = 255;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x02,
    HostUnreachable = 0x03,
    NetworkUnreachable = 0x04,
    ConnectionTimeout = 0x05,
    DnsFailure = 0x06,
    TunnelUnavailable = 0x07,
}

impl ProxyStatus {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => ProxyStatus::Success,
            0x01 => ProxyStatus::GeneralFailure,
            0x02 => ProxyStatus::ConnectionRefused,
            0x03 => ProxyStatus::HostUnreachable,
            0x04 => ProxyStatus::NetworkUnreachable,
            0x05 => ProxyStatus::ConnectionTimeout,
            0x06 => ProxyStatus::DnsFailure,
            0x07 => ProxyStatus::TunnelUnavailable,
            _ => return None,
        })
    }

    /// Status for a failed direct dial.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ProxyStatus::ConnectionRefused,
            io::ErrorKind::TimedOut => ProxyStatus::ConnectionTimeout,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::HostUnreachable => ProxyStatus::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ProxyStatus::NetworkUnreachable,
            _ => ProxyStatus::GeneralFailure,
        }
    }

    /// Status for a failed divert through the tunnel.
    pub fn from_tunnel_error(err: &TunnelError) -> Self {
        match err {
            TunnelError::Unavailable(_) => ProxyStatus::TunnelUnavailable,
            TunnelError::Timeout(_) => ProxyStatus::ConnectionTimeout,
            TunnelError::Refused(reason) if reason.contains("resolve") => ProxyStatus::DnsFailure,
            TunnelError::Refused(reason) if reason.contains("refused") => ProxyStatus::ConnectionRefused,
            TunnelError::Refused(_) => ProxyStatus::HostUnreachable,
            _ => ProxyStatus::GeneralFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProxyStatus::Success)
    }
}

/// Destination named in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddress {
    fn addr_type(&self) -> u8 {
        match self {
            TargetAddress::Ip(IpAddr::V4(_)) => 0x01,
            TargetAddress::Ip(IpAddr::V6(_)) => 0x04,
            TargetAddress::Domain(_) => 0x03,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            TargetAddress::Ip(IpAddr::V4(a)) => a.octets().to_vec(),
            TargetAddress::Ip(IpAddr::V6(a)) => a.octets().to_vec(),
            TargetAddress::Domain(name) => name.as_bytes().to_vec(),
        }
    }

    fn decode(addr_type: u8, data: &[u8]) -> io::Result<Self> {
        match addr_type {
            0x01 => {
                let octets: [u8; 4] = data
                    .try_into()
                    .map_err(|_| invalid("invalid IPv4 address length"))?;
                Ok(TargetAddress::Ip(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            0x04 => {
                let octets: [u8; 16] = data
                    .try_into()
                    .map_err(|_| invalid("invalid IPv6 address length"))?;
                Ok(TargetAddress::Ip(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            0x03 => {
                let name = String::from_utf8(data.to_vec()).map_err(|_| invalid("invalid domain name"))?;
                if name.is_empty() {
                    return Err(invalid("empty domain name"));
                }
                Ok(TargetAddress::Domain(name))
            }
            other => Err(invalid(&format!("invalid address type {other:#04x}"))),
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddress::Ip(ip) => write!(f, "{ip}"),
            TargetAddress::Domain(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: TargetAddress,
    pub port: u16,
}

impl ConnectRequest {
    pub fn new(address: TargetAddress, port: u16) -> Self {
        Self { address, port }
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(TargetAddress::Domain(name.into()), port)
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self::new(TargetAddress::Ip(ip), port)
    }

    pub fn encode(&self) -> Vec<u8> {
        let addr = self.address.encode();
        let mut buf = Vec::with_capacity(6 + addr.len());
        buf.push(MSG_CONNECT);
        buf.push(self.address.addr_type());
        buf.extend_from_slice(&(addr.len() as u16).to_le_bytes());
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        if header[0] != MSG_CONNECT {
            return Err(invalid("expected CONNECT message"));
        }
        let addr_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        if addr_len > MAX_DOMAIN_LEN {
            return Err(invalid("address too long"));
        }
        let mut addr = vec![0u8; addr_len];
        reader.read_exact(&mut addr).await?;
        let mut port = [0u8; 2];
        reader.read_exact(&mut port).await?;

        Ok(Self {
            address: TargetAddress::decode(header[1], &addr)?,
            port: u16::from_le_bytes(port),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: ProxyStatus,
    pub bound_port: u16,
}

impl ConnectResponse {
    pub fn success(bound_port: u16) -> Self {
        Self {
            status: ProxyStatus::Success,
            bound_port,
        }
    }

    pub fn failure(status: ProxyStatus) -> Self {
        Self { status, bound_port: 0 }
    }

    pub fn encode(&self) -> [u8; 4] {
        let port = self.bound_port.to_le_bytes();
        [MSG_RESPONSE, self.status as u8, port[0], port[1]]
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;
        if buf[0] != MSG_RESPONSE {
            return Err(invalid("expected CONNECT response"));
        }
        let status = ProxyStatus::from_u8(buf[1]).ok_or_else(|| invalid("unknown proxy status"))?;
        Ok(Self {
            status,
            bound_port: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_request_layout() {
        let req = ConnectRequest::domain("echo", 8080);
        assert_eq!(req.encode(), vec![0x01, 0x03, 4, 0, b'e', b'c', b'h', b'o', 0x90, 0x1f]);
    }

    #[tokio::test]
    async fn reads_ipv4_request() {
        let bytes = ConnectRequest::ip("10.96.0.1".parse().unwrap(), 443).encode();
        let req = ConnectRequest::read_from(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(req.address, TargetAddress::Ip("10.96.0.1".parse().unwrap()));
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn rejects_wrong_message_type() {
        let bytes = [0x02u8, 0x01, 4, 0, 1, 2, 3, 4, 0, 0];
        assert!(ConnectRequest::read_from(&mut bytes.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_bad_ipv4_length() {
        let bytes = [0x01u8, 0x01, 3, 0, 1, 2, 3, 0, 0];
        assert!(ConnectRequest::read_from(&mut bytes.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn response_carries_status() {
        let bytes = ConnectResponse::failure(ProxyStatus::TunnelUnavailable).encode();
        assert_eq!(bytes, [0x02, 0x07, 0, 0]);
        let resp = ConnectResponse::read_from(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(resp.status, ProxyStatus::TunnelUnavailable);
        assert!(!resp.status.is_success());
    }

    #[test]
    fn tunnel_errors_map_to_statuses() {
        assert_eq!(
            ProxyStatus::from_tunnel_error(&TunnelError::Unavailable("closed".into())),
            ProxyStatus::TunnelUnavailable
        );
        assert_eq!(
            ProxyStatus::from_tunnel_error(&TunnelError::Refused("cannot resolve nope".into())),
            ProxyStatus::DnsFailure
        );
        assert_eq!(
            ProxyStatus::from_tunnel_error(&TunnelError::Refused("connection refused".into())),
            ProxyStatus::ConnectionRefused
        );
    }
}
