//! Protocol sniffers
//!
//! Each sniffer consumes the opening bytes of a client stream, unties one
//! knot from the host/SNI field it finds there, and produces the rewritten
//! bytes to re-inject in front of the rest of the stream.

pub mod http;
pub mod socks;
pub mod tls;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::chain::Knot;

/// Application protocol recognized on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http,
    Socks4,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tls => "tls",
            Protocol::Http => "http",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }
}

/// Outcome of sniffing one connection.
#[derive(Debug)]
pub struct Sniffed {
    /// Rewritten protocol prefix to deliver upstream before the rest of
    /// the client stream.
    pub prefix: Vec<u8>,
    pub protocol: Protocol,
    /// Next hop untied from the host/SNI field; `None` means the chain is
    /// exhausted and the connection belongs to a terminal backend.
    pub next: Option<Knot>,
}

/// Sniff a plain (non-TLS) connection: peek the first byte and branch to
/// the SOCKS4, SOCKS5, or HTTP parser.
pub async fn sniff_plain<R>(reader: &mut R) -> Result<Sniffed>
where
    R: AsyncBufRead + Unpin,
{
    let first = {
        let buf = reader.fill_buf().await?;
        *buf.first().context("connection closed before any data")?
    };
    match first {
        socks::SOCKS4_VERSION => socks::sniff_socks4(reader).await,
        socks::SOCKS5_VERSION => socks::sniff_socks5(reader).await,
        _ => http::sniff_http(reader).await,
    }
}
