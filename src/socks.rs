use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    str,
    time::Duration,
};

use log::debug;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::other;

#[allow(dead_code)]
pub(crate) mod v5 {
    pub const VERSION: u8 = 5;

    pub const METH_NO_AUTH: u8 = 0;
    pub const METH_USER_PASS: u8 = 2;
    pub const METH_NO_ACCEPTABLE: u8 = 0xff;

    pub const AUTH_VERSION: u8 = 1;
    pub const AUTH_SUCCESS: u8 = 0;
    pub const AUTH_FAILURE: u8 = 1;

    pub const CMD_CONNECT: u8 = 1;

    pub const REP_SUCCEEDED: u8 = 0;
    pub const REP_GENERAL_FAILURE: u8 = 1;
    pub const REP_COMMAND_NOT_SUPPORTED: u8 = 7;

    pub const ATYP_IPV4: u8 = 1;
    pub const ATYP_IPV6: u8 = 4;
    pub const ATYP_DOMAIN: u8 = 3;
}

/// Bounds the outbound connect, resolution included.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AddressError {
    /// More bytes are needed. Only the caller knows whether more can still arrive.
    #[error("address header truncated")]
    Truncated,
    #[error("unknown ATYP received: {0}")]
    UnknownType(u8),
    #[error("hostname is not valid utf-8")]
    InvalidDomain,
}

/// The `[atyp][addr][port]` destination shared by the SOCKS5 request and the
/// shadowsocks stream header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddress {
    pub kind: AddressKind,
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub fn new(kind: AddressKind, host: impl Into<String>, port: u16) -> TargetAddress {
        TargetAddress {
            kind,
            host: host.into(),
            port,
        }
    }

    /// Parses a header from the front of `buf`, returning the address and the number of
    /// bytes it occupied. Bytes after it belong to the payload.
    pub fn decode(buf: &[u8]) -> Result<(TargetAddress, usize), AddressError> {
        let atyp = *buf.first().ok_or(AddressError::Truncated)?;
        let (kind, host, pos) = match atyp {
            v5::ATYP_IPV4 => {
                let b = buf.get(1..5).ok_or(AddressError::Truncated)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                (AddressKind::Ipv4, ip.to_string(), 5)
            }
            v5::ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or(AddressError::Truncated)? as usize;
                let name = buf.get(2..2 + len).ok_or(AddressError::Truncated)?;
                let name = str::from_utf8(name).map_err(|_| AddressError::InvalidDomain)?;
                (AddressKind::Domain, name.to_string(), 2 + len)
            }
            v5::ATYP_IPV6 => {
                let b = buf.get(1..17).ok_or(AddressError::Truncated)?;
                // Full groups, no zero compression.
                let groups: Vec<String> = b
                    .chunks(2)
                    .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                    .collect();
                (AddressKind::Ipv6, groups.join(":"), 17)
            }
            n => return Err(AddressError::UnknownType(n)),
        };

        let port = buf.get(pos..pos + 2).ok_or(AddressError::Truncated)?;
        let port = u16::from_be_bytes([port[0], port[1]]);
        Ok((TargetAddress { kind, host, port }, pos + 2))
    }

    /// Writes the header form of this address to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        match self.kind {
            AddressKind::Ipv4 => {
                let ip: Ipv4Addr = self
                    .host
                    .parse()
                    .map_err(|_| other(&format!("invalid ipv4 address {}", self.host)))?;
                out.push(v5::ATYP_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            AddressKind::Ipv6 => {
                let ip: Ipv6Addr = self
                    .host
                    .parse()
                    .map_err(|_| other(&format!("invalid ipv6 address {}", self.host)))?;
                out.push(v5::ATYP_IPV6);
                out.extend_from_slice(&ip.octets());
            }
            AddressKind::Domain => {
                let len = u8::try_from(self.host.len())
                    .map_err(|_| other(&format!("hostname too long: {}", self.host.len())))?;
                out.push(v5::ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(self.host.as_bytes());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressKind::Ipv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

// Resolves the target to a socket address. Literal IP hosts skip DNS resolution.
async fn resolve(target: &TargetAddress) -> io::Result<SocketAddr> {
    if let Ok(ip) = target.host.parse() {
        return Ok(SocketAddr::new(ip, target.port));
    }
    debug!("lookup_host {}", target.host);
    let mut addrs = lookup_host((target.host.as_str(), target.port)).await?;
    debug!("lookup_host {} success", target.host);
    addrs
        .next()
        .ok_or_else(|| other(&format!("wrong hostname {}", target.host)))
}

/// Opens the outbound connection for a parsed target.
pub async fn connect_target(target: &TargetAddress) -> io::Result<TcpStream> {
    let dial = async {
        let addr = resolve(target).await?;
        debug!("proxying to {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        io::Result::Ok(stream)
    };
    match timeout(DIAL_TIMEOUT, dial).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", target),
        )),
    }
}
