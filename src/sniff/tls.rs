//! TLS ClientHello sniffing
//!
//! Reads a single TLS record, walks the ClientHello to the `server_name`
//! extension, unties the knot chain in the name, and splices the rewritten
//! name back in. Every enclosing length field (record, handshake,
//! extensions block, extension, name list, name) is recomputed, so the
//! emitted record is well-formed whatever the rewritten name's length.

use anyhow::{bail, ensure, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Protocol, Sniffed};
use crate::chain;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Offsets of the SNI name and of every length field that encloses it.
/// All length offsets precede the name, so a splice leaves them in place.
struct SniSpan {
    ext_block_len_at: usize,
    ext_len_at: usize,
    list_len_at: usize,
    name_len_at: usize,
    name_start: usize,
    name_end: usize,
}

pub async fn sniff_client_hello<R>(reader: &mut R) -> Result<Sniffed>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    if header[0] != RECORD_HANDSHAKE {
        bail!("not a TLS handshake record (type {})", header[0]);
    }
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; record_len];
    reader.read_exact(&mut payload).await?;

    let span = match locate_sni(&payload)? {
        Some(span) => span,
        None => {
            // No server_name extension: forward the record untouched.
            let mut prefix = header.to_vec();
            prefix.extend_from_slice(&payload);
            return Ok(Sniffed {
                prefix,
                protocol: Protocol::Tls,
                next: None,
            });
        }
    };

    let name = std::str::from_utf8(&payload[span.name_start..span.name_end])
        .context("SNI is not UTF-8")?;
    let (next, new_name) = chain::untie_hostname(name).await?;

    let delta = new_name.len() as isize - (span.name_end - span.name_start) as isize;
    let mut new_payload = payload;
    new_payload.splice(
        span.name_start..span.name_end,
        new_name.bytes(),
    );
    bump_u16(&mut new_payload, span.name_len_at, delta)?;
    bump_u16(&mut new_payload, span.list_len_at, delta)?;
    bump_u16(&mut new_payload, span.ext_len_at, delta)?;
    bump_u16(&mut new_payload, span.ext_block_len_at, delta)?;
    bump_u24(&mut new_payload, 1, delta)?;
    ensure!(
        new_payload.len() <= u16::MAX as usize,
        "rewritten ClientHello overflows the record"
    );

    let mut prefix = Vec::with_capacity(5 + new_payload.len());
    prefix.extend_from_slice(&header[..3]);
    prefix.extend_from_slice(&(new_payload.len() as u16).to_be_bytes());
    prefix.extend_from_slice(&new_payload);
    Ok(Sniffed {
        prefix,
        protocol: Protocol::Tls,
        next,
    })
}

/// Walk the ClientHello down to the host_name entry of the server_name
/// extension. Returns `None` when the hello carries no SNI.
fn locate_sni(payload: &[u8]) -> Result<Option<SniSpan>> {
    if payload.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        bail!("not a ClientHello handshake");
    }
    let hs_len = slice_at(payload, 1, 3)?;
    let hs_len = ((hs_len[0] as usize) << 16) | ((hs_len[1] as usize) << 8) | hs_len[2] as usize;
    let hs_end = 4 + hs_len;
    ensure!(hs_end <= payload.len(), "malformed ClientHello: truncated");

    // client version + random
    let mut p = 4 + 2 + 32;
    // session id
    let sid_len = slice_at(payload, p, 1)?[0] as usize;
    p += 1 + sid_len;
    // cipher suites
    let cs_len = u16_at(payload, p)?;
    p += 2 + cs_len;
    // compression methods
    let cm_len = slice_at(payload, p, 1)?[0] as usize;
    p += 1 + cm_len;

    if p == hs_end {
        return Ok(None); // no extensions block at all
    }
    let ext_block_len_at = p;
    let ext_total = u16_at(payload, p)?;
    p += 2;
    let ext_end = p + ext_total;
    ensure!(ext_end <= hs_end, "malformed ClientHello: extensions overflow");

    while p + 4 <= ext_end {
        let ext_type = u16_at(payload, p)? as u16;
        let ext_len_at = p + 2;
        let ext_len = u16_at(payload, ext_len_at)?;
        p += 4;
        ensure!(p + ext_len <= ext_end, "malformed ClientHello: extension overflow");
        if ext_type != EXT_SERVER_NAME {
            p += ext_len;
            continue;
        }

        let list_len_at = p;
        let list_len = u16_at(payload, p)?;
        let mut q = p + 2;
        let list_end = q + list_len;
        ensure!(list_end <= p + ext_len, "malformed server_name extension");
        while q + 3 <= list_end {
            let name_type = payload[q];
            let name_len_at = q + 1;
            let name_len = u16_at(payload, name_len_at)?;
            q += 3;
            ensure!(q + name_len <= list_end, "malformed server_name entry");
            if name_type == NAME_TYPE_HOST {
                return Ok(Some(SniSpan {
                    ext_block_len_at,
                    ext_len_at,
                    list_len_at,
                    name_len_at,
                    name_start: q,
                    name_end: q + name_len,
                }));
            }
            q += name_len;
        }
        return Ok(None);
    }
    Ok(None)
}

fn slice_at(b: &[u8], at: usize, n: usize) -> Result<&[u8]> {
    b.get(at..at + n)
        .context("malformed ClientHello: truncated")
}

fn u16_at(b: &[u8], at: usize) -> Result<usize> {
    let s = slice_at(b, at, 2)?;
    Ok(u16::from_be_bytes([s[0], s[1]]) as usize)
}

fn bump_u16(buf: &mut [u8], at: usize, delta: isize) -> Result<()> {
    let old = u16::from_be_bytes([buf[at], buf[at + 1]]) as isize;
    let new = old + delta;
    ensure!((0..=u16::MAX as isize).contains(&new), "length field overflow");
    buf[at..at + 2].copy_from_slice(&(new as u16).to_be_bytes());
    Ok(())
}

fn bump_u24(buf: &mut [u8], at: usize, delta: isize) -> Result<()> {
    let old = ((buf[at] as isize) << 16) | ((buf[at + 1] as isize) << 8) | buf[at + 2] as isize;
    let new = old + delta;
    ensure!((0..=0xff_ffff_isize).contains(&new), "length field overflow");
    buf[at] = (new >> 16) as u8;
    buf[at + 1] = (new >> 8) as u8;
    buf[at + 2] = new as u8;
    Ok(())
}

/// Assemble a minimal ClientHello record carrying `sni`, for tests.
#[cfg(test)]
pub(crate) fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let mut data = Vec::new();
        data.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
        data.push(NAME_TYPE_HOST);
        data.extend_from_slice(&(name.len() as u16).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&data);
    }
    // An unrelated extension after the SNI keeps the walker honest.
    extensions.extend_from_slice(&0x000au16.to_be_bytes()); // supported_groups
    extensions.extend_from_slice(&4u16.to_be_bytes());
    extensions.extend_from_slice(&[0x00, 0x02, 0x00, 0x1d]);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client version
    hello.extend_from_slice(&[0xab; 32]); // random
    hello.push(0); // session id
    hello.extend_from_slice(&2u16.to_be_bytes()); // cipher suites
    hello.extend_from_slice(&[0x13, 0x01]);
    hello.push(1); // compression methods
    hello.push(0);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.push((hello.len() >> 16) as u8);
    handshake.push((hello.len() >> 8) as u8);
    handshake.push(hello.len() as u8);
    handshake.extend_from_slice(&hello);

    let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
