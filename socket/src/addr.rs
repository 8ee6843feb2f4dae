use std::{
    fmt::Display,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
    sync::Arc,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::lookup_host,
};

pub const ADDRESS_TYPE_IPV4: u8 = 0x01;
pub const ADDRESS_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDRESS_TYPE_IPV6: u8 = 0x04;

/// A SOCKS5 destination address.
///
/// ```text
/// +------+----------+----------+
/// | ATYP | DST.ADDR | DST.PORT |
/// +------+----------+----------+
/// |  1   | Variable |    2     |
/// +------+----------+----------+
/// ```
///
/// `Domain` carries the IP resolved on the first [`Address::resolve_ip`]
/// call. The value is owned by the handshake that decoded it and is never
/// shared across connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Domain {
        name: Arc<str>,
        port: u16,
        resolved: Option<IpAddr>,
    },
}

impl Address {
    /// An IP-literal host yields the `Ipv4`/`Ipv6` variant, anything else
    /// a `Domain`.
    pub fn from_host_and_port<H>(host: H, port: u16) -> Self
    where
        H: Into<Arc<str>> + AsRef<str>,
    {
        match host.as_ref().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Self::Ipv4(SocketAddrV4::new(ip, port)),
            Ok(IpAddr::V6(ip)) => Self::Ipv6(SocketAddrV6::new(ip, port, 0, 0)),
            Err(_) => Self::Domain {
                name: host.into(),
                port,
                resolved: None,
            },
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4(addr) => addr.port(),
            Self::Ipv6(addr) => addr.port(),
            Self::Domain { port, .. } => *port,
        }
    }

    /// Decodes the address type tag, address, and big-endian port.
    ///
    /// A domain name that is textually an IP literal is normalized to the
    /// corresponding IP variant; the wire tag actually read is not
    /// preserved for such inputs.
    pub async fn decode<R>(reader: &mut R) -> Result<Self, DecodeAddressError>
    where
        R: AsyncRead + Unpin,
    {
        let address_type = reader.read_u8().await?;
        match address_type {
            ADDRESS_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ipv4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
            }
            ADDRESS_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(Self::Ipv6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                )))
            }
            ADDRESS_TYPE_DOMAIN_NAME => {
                let len = reader.read_u8().await?;
                let mut buf = vec![0u8; len as usize];
                reader.read_exact(&mut buf).await?;
                let name = String::from_utf8(buf)
                    .map_err(|_| DecodeAddressError::InvalidDomainName)?;
                let port = reader.read_u16().await?;
                Ok(Self::from_host_and_port(name, port))
            }
            tag => Err(DecodeAddressError::UnsupportedAddressType(tag)),
        }
    }

    pub async fn encode<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            Self::Ipv4(addr) => {
                writer.write_u8(ADDRESS_TYPE_IPV4).await?;
                writer.write_all(&addr.ip().octets()).await?;
                writer.write_u16(addr.port()).await?;
            }
            Self::Ipv6(addr) => {
                writer.write_u8(ADDRESS_TYPE_IPV6).await?;
                writer.write_all(&addr.ip().octets()).await?;
                writer.write_u16(addr.port()).await?;
            }
            Self::Domain { name, port, .. } => {
                writer.write_u8(ADDRESS_TYPE_DOMAIN_NAME).await?;
                let len = u8::try_from(name.len())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                writer.write_u8(len).await?;
                writer.write_all(name.as_bytes()).await?;
                writer.write_u16(*port).await?;
            }
        }
        Ok(())
    }

    /// Returns the IP for this address, resolving a domain name on first
    /// call and caching the result for subsequent ones.
    pub async fn resolve_ip(&mut self) -> io::Result<IpAddr> {
        match self {
            Self::Ipv4(addr) => Ok(IpAddr::V4(*addr.ip())),
            Self::Ipv6(addr) => Ok(IpAddr::V6(*addr.ip())),
            Self::Domain {
                name,
                port,
                resolved,
            } => {
                if let Some(ip) = resolved {
                    return Ok(*ip);
                }
                let mut addrs = lookup_host((name.as_ref(), *port)).await?;
                let ip = addrs
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "No address"))?
                    .ip();
                *resolved = Some(ip);
                Ok(ip)
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => Self::Ipv4(addr),
            SocketAddr::V6(addr) => Self::Ipv6(addr),
        }
    }
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let mut parts = s.split(':');
        let host = parts.next().ok_or(ParseAddressError)?;
        let port = parts.next().ok_or(ParseAddressError)?;
        let port = port.parse().map_err(|_| ParseAddressError)?;
        if parts.next().is_some() {
            return Err(ParseAddressError);
        }
        Ok(Self::from_host_and_port(host, port))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4(addr) => write!(f, "{addr}"),
            Self::Ipv6(addr) => write!(f, "{addr}"),
            Self::Domain { name, port, .. } => write!(f, "{name}:{port}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeAddressError {
    #[error("Unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("Domain name is not valid UTF-8")]
    InvalidDomainName,
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, Clone, Copy)]
#[error("Failed to parse address")]
pub struct ParseAddressError;
