//! HTTP/1.x request-head sniffing
//!
//! Reads the request head off the stream, unties the knot chain inside the
//! Host (or the absolute-URI authority), and re-serializes the head with
//! the rewritten value. Bodies are never buffered; they stream through the
//! relay behind the rewritten prefix.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::{Protocol, Sniffed};
use crate::chain;

const MAX_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

pub async fn sniff_http<R>(reader: &mut R) -> Result<Sniffed>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(&head).context("not an HTTP request")?;
    if status.is_partial() {
        bail!("truncated HTTP request head");
    }
    let method = req.method.context("missing HTTP method")?;
    let path = req.path.context("missing HTTP request target")?;
    let minor = req.version.context("missing HTTP version")?;

    // Absolute-form targets carry the authority in the request line; the
    // Host header is authoritative otherwise.
    let absolute = split_absolute_uri(path);
    let authority = match &absolute {
        Some((_, authority, _)) => (*authority).to_owned(),
        None => {
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .context("missing Host header")?;
            std::str::from_utf8(host.value)
                .context("Host header is not UTF-8")?
                .trim()
                .to_owned()
        }
    };

    let (host, port) = split_host_port(&authority);
    let (next, new_host) = chain::untie_hostname(host).await?;
    let new_authority = match port {
        Some(port) => format!("{new_host}:{port}"),
        None => new_host,
    };

    let mut prefix = Vec::with_capacity(head.len());
    match &absolute {
        Some((scheme, _, rest)) => {
            prefix.extend_from_slice(
                format!("{method} {scheme}://{new_authority}{rest} HTTP/1.{minor}\r\n").as_bytes(),
            );
        }
        None => {
            prefix.extend_from_slice(format!("{method} {path} HTTP/1.{minor}\r\n").as_bytes());
        }
    }
    for header in req.headers.iter() {
        prefix.extend_from_slice(header.name.as_bytes());
        prefix.extend_from_slice(b": ");
        if header.name.eq_ignore_ascii_case("host") {
            prefix.extend_from_slice(new_authority.as_bytes());
        } else {
            prefix.extend_from_slice(header.value);
        }
        prefix.extend_from_slice(b"\r\n");
    }
    prefix.extend_from_slice(b"\r\n");

    Ok(Sniffed {
        prefix,
        protocol: Protocol::Http,
        next,
    })
}

/// Read lines up to and including the blank line terminating the head.
async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            bail!("connection closed inside HTTP request head");
        }
        if head.len() > MAX_HEAD {
            bail!("HTTP request head exceeds {MAX_HEAD} bytes");
        }
        if &head[start..] == b"\r\n" || &head[start..] == b"\n" {
            break;
        }
    }
    Ok(head)
}

/// Split `scheme://authority/rest` into its parts, if the target is in
/// absolute form.
fn split_absolute_uri(path: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = path.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return None;
    }
    let end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    Some((scheme, &rest[..end], &rest[end..]))
}

/// Split an authority into host and optional port, honoring IPv6 brackets.
fn split_host_port(authority: &str) -> (&str, Option<&str>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            if let Some(port) = rest[end + 1..].strip_prefix(':') {
                return (host, Some(port));
            }
            return (host, None);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (host, Some(port))
        }
        _ => (authority, None),
    }
}
