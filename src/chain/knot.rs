//! Knot endpoint variants
//!
//! A knot is one hop of a proxy chain. On the wire each knot is a single
//! tag byte (written by the chain codec) followed by a tag-less body:
//! - IPv4:   [Addr(4)][Port(2 BE)]
//! - IPv6:   [Addr(16)][Port(2 BE)]
//! - Domain: [HostLen(1)][Host(N)][Port(2 BE)]
//! - Refer:  [Port(2 BE)], the hostname being the enclosing DNS stem

use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::net::{lookup_host, TcpStream};

use super::ChainError;

/// Wire tags discriminating the knot variants.
pub const TAG_IPV4: u8 = 0x01;
pub const TAG_DOMAIN: u8 = 0x03;
pub const TAG_IPV6: u8 = 0x04;
pub const TAG_REFER: u8 = 0xa1;

/// One hop of a proxy chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Knot {
    Ip(IpKnot),
    Domain(DomainKnot),
    Refer(ReferKnot),
}

impl Knot {
    pub fn tag(&self) -> u8 {
        match self {
            Knot::Ip(k) => k.tag(),
            Knot::Domain(_) => TAG_DOMAIN,
            Knot::Refer(_) => TAG_REFER,
        }
    }

    /// Printable address: the IP or the domain name.
    pub fn host(&self) -> String {
        match self {
            Knot::Ip(k) => k.addr.to_string(),
            Knot::Domain(k) => k.host.clone(),
            Knot::Refer(k) => k.domain.host.clone(),
        }
    }

    /// Effective destination port (the IP4P dynamic port wins for domains).
    pub fn port(&self) -> u16 {
        match self {
            Knot::Ip(k) => k.port,
            Knot::Domain(k) => k.effective_port(),
            Knot::Refer(k) => k.domain.effective_port(),
        }
    }

    /// Tag-less wire body.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Knot::Ip(k) => k.encode(),
            Knot::Domain(k) => k.encode(),
            Knot::Refer(k) => k.encode(),
        }
    }

    /// Length of the tag-less wire body in octets.
    pub fn encoded_len(&self) -> usize {
        match self {
            Knot::Ip(k) => k.encoded_len(),
            Knot::Domain(k) => k.encoded_len(),
            Knot::Refer(_) => 2,
        }
    }

    /// Open an outbound TCP connection to this hop.
    pub async fn dial(&self) -> Result<TcpStream> {
        match self {
            Knot::Ip(k) => k.dial().await,
            Knot::Domain(k) => k.dial().await,
            Knot::Refer(k) => k.domain.dial().await,
        }
    }
}

impl fmt::Display for Knot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host();
        if host.contains(':') {
            write!(f, "[{}]:{}", host, self.port())
        } else {
            write!(f, "{}:{}", host, self.port())
        }
    }
}

/// Literal IPv4 or IPv6 endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpKnot {
    pub addr: IpAddr,
    pub port: u16,
}

impl IpKnot {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    fn tag(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => TAG_IPV4,
            IpAddr::V6(_) => TAG_IPV6,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = match self.addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    fn encoded_len(&self) -> usize {
        match self.addr {
            IpAddr::V4(_) => 4 + 2,
            IpAddr::V6(_) => 16 + 2,
        }
    }

    pub fn decode_v4(b: &[u8]) -> Result<Self, ChainError> {
        if b.len() < 6 {
            return Err(ChainError::Insufficient("IPv4"));
        }
        let addr = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let port = u16::from_be_bytes([b[4], b[5]]);
        Ok(Self::new(IpAddr::V4(addr), port))
    }

    pub fn decode_v6(b: &[u8]) -> Result<Self, ChainError> {
        if b.len() < 18 {
            return Err(ChainError::Insufficient("IPv6"));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&b[..16]);
        let port = u16::from_be_bytes([b[16], b[17]]);
        Ok(Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
    }

    async fn dial(&self) -> Result<TcpStream> {
        TcpStream::connect((self.addr, self.port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", self.addr, self.port))
    }
}

/// Domain-name endpoint, with resolved state populated at decode time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainKnot {
    pub host: String,
    pub port: u16,

    /// Addresses resolved during decode; cached for the knot's lifetime.
    pub resolved: Vec<IpAddr>,
    /// Port extracted from an IP4P resolution result; overrides `port`.
    pub dyn_port: u16,
}

impl DomainKnot {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.dyn_port != 0 {
            self.dyn_port
        } else {
            self.port
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        debug_assert!(self.host.len() <= 255, "domain name is too long");
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.host.len() as u8);
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn encoded_len(&self) -> usize {
        self.host.len() + 3
    }

    /// Decode a domain body. A zero declared port triggers a one-shot DNS
    /// lookup to discover an IP4P address carrying the real target.
    pub async fn decode(b: &[u8]) -> Result<Self, ChainError> {
        let &host_len = b.first().ok_or(ChainError::Insufficient("domain"))?;
        let host_len = host_len as usize;
        if b.len() < host_len + 3 {
            return Err(ChainError::Insufficient("domain"));
        }
        let host = std::str::from_utf8(&b[1..1 + host_len])
            .map_err(|_| ChainError::InvalidHostname)?
            .to_owned();
        let port = u16::from_be_bytes([b[host_len + 1], b[host_len + 2]]);
        let mut knot = Self::new(host, port);
        if knot.port == 0 {
            knot.discover_ip4p().await?;
        }
        Ok(knot)
    }

    /// Resolve the hostname and scan the results for an IP4P address. On a
    /// hit the IPv4 inside it becomes the sole dial target and its embedded
    /// port the dynamic port; otherwise all results are kept in order.
    async fn discover_ip4p(&mut self) -> Result<(), ChainError> {
        let addrs = lookup_host((self.host.as_str(), 0u16))
            .await
            .map_err(|source| ChainError::Resolve {
                host: self.host.clone(),
                source,
            })?;
        let ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        for ip in &ips {
            if let IpAddr::V6(v6) = ip {
                if let Some((v4, port)) = ip4p(v6) {
                    self.resolved = vec![IpAddr::V4(v4)];
                    self.dyn_port = port;
                    return Ok(());
                }
            }
        }
        self.resolved = ips;
        Ok(())
    }

    /// Dial each resolved address in turn; fall back to the system resolver
    /// when decode did not resolve.
    async fn dial(&self) -> Result<TcpStream> {
        let port = self.effective_port();
        if !self.resolved.is_empty() {
            let mut last_err = None;
            for ip in &self.resolved {
                match TcpStream::connect((*ip, port)).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => last_err = Some(e),
                }
            }
            return Err(last_err.expect("resolved list is non-empty"))
                .with_context(|| format!("all resolved addresses of {} failed", self.host));
        }
        TcpStream::connect((self.host.as_str(), port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", self.host, port))
    }
}

/// Domain knot whose hostname is elided from the wire: only the port is
/// carried, the hostname comes from the enclosing DNS stem at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferKnot {
    pub domain: DomainKnot,
}

impl ReferKnot {
    fn encode(&self) -> Vec<u8> {
        self.domain.port.to_be_bytes().to_vec()
    }

    pub fn decode(b: &[u8], stem: &str) -> Result<Self, ChainError> {
        if b.len() < 2 {
            return Err(ChainError::Insufficient("refer"));
        }
        let port = u16::from_be_bytes([b[0], b[1]]);
        Ok(Self {
            domain: DomainKnot::new(stem, port),
        })
    }
}

impl From<DomainKnot> for ReferKnot {
    fn from(domain: DomainKnot) -> Self {
        Self { domain }
    }
}

/// IP4P: an IPv6 address under 2001:0000::/80 whose low bytes smuggle an
/// IPv4 address (octets 12..16) and a port (octets 10..12).
pub fn ip4p(addr: &Ipv6Addr) -> Option<(Ipv4Addr, u16)> {
    let o = addr.octets();
    if o[..10] != [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0] {
        return None;
    }
    let port = u16::from_be_bytes([o[10], o[11]]);
    if port == 0 {
        return None;
    }
    Some((Ipv4Addr::new(o[12], o[13], o[14], o[15]), port))
}
