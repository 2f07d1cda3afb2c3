//! SOCKS4/4a and SOCKS5 request sniffing
//!
//! Both parsers read exactly one request frame, untie the domain it
//! addresses (IP destinations pass through untouched), and rebuild the
//! frame for re-injection upstream. The router never answers the client;
//! replies come from whatever finally terminates the connection.

use anyhow::{bail, Context, Result};
use bytes::BufMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{Protocol, Sniffed};
use crate::chain;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Cap on the null-terminated SOCKS4 userid and hostname fields.
const MAX_FIELD: usize = 1024;

/// Sniff a SOCKS4 CONNECT: `[0x04][CD][Port(2)][IP(4)][UserId]\0` with the
/// 4a extension `[Host]\0` when the IP is 0.0.0.x (x != 0).
pub async fn sniff_socks4<R>(reader: &mut R) -> Result<Sniffed>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = [0u8; 8];
    reader.read_exact(&mut head).await?;
    let cmd = head[1];
    let port = [head[2], head[3]];
    let ip = [head[4], head[5], head[6], head[7]];
    let userid = read_cstr(reader).await.context("bad SOCKS4 userid")?;

    let is_4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
    if !is_4a {
        // Literal destination: nothing to untie, forward verbatim.
        let mut prefix = head.to_vec();
        prefix.extend_from_slice(&userid);
        prefix.push(0);
        return Ok(Sniffed {
            prefix,
            protocol: Protocol::Socks4,
            next: None,
        });
    }

    let host_bytes = read_cstr(reader).await.context("bad SOCKS4a hostname")?;
    let host = std::str::from_utf8(&host_bytes).context("SOCKS4a hostname is not UTF-8")?;
    let (next, new_host) = chain::untie_hostname(host).await?;

    let mut prefix = Vec::with_capacity(8 + userid.len() + new_host.len() + 2);
    prefix.put_u8(SOCKS4_VERSION);
    prefix.put_u8(cmd);
    prefix.put_slice(&port);
    prefix.put_slice(&[0, 0, 0, 1]);
    prefix.put_slice(&userid);
    prefix.put_u8(0);
    prefix.put_slice(new_host.as_bytes());
    prefix.put_u8(0);
    Ok(Sniffed {
        prefix,
        protocol: Protocol::Socks4,
        next,
    })
}

/// Sniff a SOCKS5 request frame: `[0x05][CMD][RSV][ATYP][Addr][Port(2)]`.
pub async fn sniff_socks5<R>(reader: &mut R) -> Result<Sniffed>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let atyp = head[3];

    match atyp {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            reader.read_exact(&mut rest).await?;
            let mut prefix = head.to_vec();
            prefix.extend_from_slice(&rest);
            Ok(Sniffed {
                prefix,
                protocol: Protocol::Socks5,
                next: None,
            })
        }
        ATYP_IPV6 => {
            let mut rest = [0u8; 18];
            reader.read_exact(&mut rest).await?;
            let mut prefix = head.to_vec();
            prefix.extend_from_slice(&rest);
            Ok(Sniffed {
                prefix,
                protocol: Protocol::Socks5,
                next: None,
            })
        }
        ATYP_DOMAIN => {
            let host_len = reader.read_u8().await? as usize;
            let mut host_bytes = vec![0u8; host_len];
            reader.read_exact(&mut host_bytes).await?;
            let port = reader.read_u16().await?;

            let host =
                std::str::from_utf8(&host_bytes).context("SOCKS5 hostname is not UTF-8")?;
            let (next, new_host) = chain::untie_hostname(host).await?;
            if new_host.len() > 255 {
                bail!("rewritten hostname does not fit a SOCKS5 address");
            }

            let mut prefix = Vec::with_capacity(7 + new_host.len());
            prefix.put_slice(&head);
            prefix.put_u8(new_host.len() as u8);
            prefix.put_slice(new_host.as_bytes());
            prefix.put_u16(port);
            Ok(Sniffed {
                prefix,
                protocol: Protocol::Socks5,
                next,
            })
        }
        other => bail!("unsupported SOCKS5 address type {other}"),
    }
}

/// Read a null-terminated field, excluding the terminator.
async fn read_cstr<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(MAX_FIELD as u64 + 1);
    let n = limited.read_until(0, &mut buf).await?;
    if n == 0 || buf.last() != Some(&0) {
        bail!("missing field terminator");
    }
    buf.pop();
    if buf.len() > MAX_FIELD {
        bail!("field exceeds {MAX_FIELD} bytes");
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn socks4_literal_ip_passes_through() {
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 10, 0, 0, 1];
        req.extend_from_slice(b"user\0");
        let mut reader = BufReader::new(req.as_slice());
        let sniffed = sniff_socks4(&mut reader).await.unwrap();
        assert_eq!(sniffed.prefix, req);
        assert!(sniffed.next.is_none());
    }

    #[tokio::test]
    async fn socks4a_plain_hostname_is_kept() {
        let mut req = vec![0x04, 0x01, 0x01, 0xbb, 0, 0, 0, 1];
        req.extend_from_slice(b"\0example.com\0");
        let mut reader = BufReader::new(req.as_slice());
        let sniffed = sniff_socks4(&mut reader).await.unwrap();
        assert_eq!(sniffed.prefix, req);
        assert!(sniffed.next.is_none());
    }

    #[tokio::test]
    async fn socks5_ipv4_passes_through() {
        let req = vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
        let mut reader = BufReader::new(req.as_slice());
        let sniffed = sniff_socks5(&mut reader).await.unwrap();
        assert_eq!(sniffed.prefix, req);
        assert!(sniffed.next.is_none());
        assert_eq!(sniffed.protocol, Protocol::Socks5);
    }

    #[tokio::test]
    async fn socks5_domain_without_chain_is_kept() {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&[0x01, 0xbb]);
        let mut reader = BufReader::new(req.as_slice());
        let sniffed = sniff_socks5(&mut reader).await.unwrap();
        assert_eq!(sniffed.prefix, req);
        assert!(sniffed.next.is_none());
    }

    #[tokio::test]
    async fn socks5_unknown_atyp_is_rejected() {
        let req = vec![0x05, 0x01, 0x00, 0x09, 0, 0];
        let mut reader = BufReader::new(req.as_slice());
        assert!(sniff_socks5(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn unterminated_field_is_rejected() {
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        req.extend_from_slice(b"user-without-nul");
        let mut reader = BufReader::new(req.as_slice());
        assert!(sniff_socks4(&mut reader).await.is_err());
    }
}
