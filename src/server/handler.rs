//! Per-connection dispatch
//!
//! Sniff the opening bytes, untie one knot from the host/SNI field, then
//! either redirect to the untied endpoint or deliver to the terminal
//! backend for the sniffed protocol. Either way the rewritten prefix is
//! re-injected ahead of the rest of the client stream.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::sniff::{self, tls, Protocol, Sniffed};

use super::relay;

pub async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    is_tls: bool,
    config: &Config,
) -> Result<()> {
    let local = stream.local_addr().context("no local address")?;
    let mut reader = BufReader::new(stream);

    let sniffed = if is_tls {
        tls::sniff_client_hello(&mut reader).await
    } else {
        sniff::sniff_plain(&mut reader).await
    };
    let Sniffed {
        mut prefix,
        protocol,
        next,
    } = match sniffed {
        Ok(sniffed) => sniffed,
        Err(e) => {
            warn!(client = %peer, local = %local, error = %e, "failed to untie");
            return Ok(());
        }
    };

    // Everything the sniffer buffered but did not consume still belongs to
    // the upstream peer, right after the rewritten prefix.
    prefix.extend_from_slice(reader.buffer());
    let client = reader.into_inner();

    match next {
        Some(knot) => {
            if !config.router.allow_redir {
                warn!(client = %peer, local = %local, target = %knot, "redir is disabled");
                return Ok(());
            }
            if !config.router.allowed.contains(knot.port()) {
                warn!(client = %peer, local = %local, target = %knot, "redir port not allowed");
                return Ok(());
            }
            info!(client = %peer, target = %knot, "redirect");
            let upstream = match knot.dial().await {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(client = %peer, local = %local, target = %knot, error = %e,
                        "failed to relay");
                    return Ok(());
                }
            };
            splice(client, upstream, &prefix).await
        }
        None => {
            let backend = match protocol {
                Protocol::Tls => &config.router.final_tls,
                Protocol::Http => &config.router.final_http,
                Protocol::Socks4 | Protocol::Socks5 => &config.router.final_socks,
            };
            if backend.is_empty() {
                warn!(client = %peer, local = %local, proto = protocol.as_str(),
                    "no final backend for protocol");
                return Ok(());
            }
            info!(client = %peer, backend = %backend, proto = protocol.as_str(), "final");
            dial_backend(client, backend, peer, local, &prefix).await
        }
    }
}

/// Connect to a terminal backend: `host:port` over TCP, anything without a
/// colon as a UNIX-domain socket path.
async fn dial_backend(
    client: TcpStream,
    backend: &str,
    peer: SocketAddr,
    local: SocketAddr,
    prefix: &[u8],
) -> Result<()> {
    if backend.contains(':') {
        let upstream = match TcpStream::connect(backend).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(client = %peer, local = %local, backend = %backend, error = %e,
                    "failed to relay");
                return Ok(());
            }
        };
        return splice(client, upstream, prefix).await;
    }

    #[cfg(unix)]
    {
        let upstream = match tokio::net::UnixStream::connect(backend).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(client = %peer, local = %local, backend = %backend, error = %e,
                    "failed to relay");
                return Ok(());
            }
        };
        splice(client, upstream, prefix).await
    }
    #[cfg(not(unix))]
    {
        warn!(backend = %backend, "unix socket backends are not supported on this platform");
        Ok(())
    }
}

/// Send the rewritten prefix upstream, then copy both directions until
/// either side finishes.
async fn splice<U>(client: TcpStream, mut upstream: U, prefix: &[u8]) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    upstream
        .write_all(prefix)
        .await
        .context("failed to send rewritten prefix")?;
    if let Err(e) = relay::relay(client, upstream).await {
        debug!(error = %e, "relay terminated");
    }
    Ok(())
}
