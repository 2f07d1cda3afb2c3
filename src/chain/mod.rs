//! Knot-chain codec
//!
//! A chain of knots serializes to a compact binary payload and travels as a
//! DNS label under a stem hostname: `q--<base32(payload)>.<stem>`.
//!
//! Payload layout (MSB first):
//!
//! ```text
//! | Comp(2) | Ver(6) | CurrHop(4) | TotalHops(4) | Tag(8) | body | ...
//! |                  | >>------ optionally DEFLATE-compressed ------>> |
//! ```
//!
//! Untying peels the head knot, rotates it to the tail, and advances the
//! hop counter; once every hop is consumed the counter resets and the
//! payload is back in its pristine tied form.

pub mod knot;

use std::io::{Read, Write};
use std::sync::LazyLock;

use data_encoding::Encoding;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use thiserror::Error;

pub use knot::{DomainKnot, IpKnot, Knot, ReferKnot};

/// Chain format version carried in the low six bits of the frame byte.
pub const VERSION_1: u8 = 0x01;

const COMP_NONE: u8 = 0;
const COMP_DEFLATE: u8 = 1;

/// Hard DNS limit on a full hostname.
pub const MAX_HOSTNAME: usize = 253;
/// The hop count lives in a nibble.
pub const MAX_KNOTS: usize = 0b1111;
/// Label marker identifying a tied chain.
pub const LABEL_PREFIX: &str = "q--";

/// Lowercase RFC 4648 base32 without padding, safe inside a DNS label.
static BASE32_DNS: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("valid base32 specification")
});

/// Codec failures. End-of-chain is not an error: untie operations return
/// `Ok` with no knot once the chain is fully traversed.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain is too long: {0} knots (max {MAX_KNOTS})")]
    ChainTooLong(usize),

    #[error("{0} parse error, insufficient length")]
    Insufficient(&'static str),

    #[error("unsupported chain version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown knot tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("bad hop counter 0x{0:02x}")]
    BadHopCounter(u8),

    #[error("domain name is too long: {0} octets (max 255)")]
    DomainTooLong(usize),

    #[error("domain name is not valid UTF-8")]
    InvalidHostname,

    #[error("hostname is too long: {0} > {MAX_HOSTNAME}")]
    HostnameTooLong(usize),

    #[error("bad base32 label")]
    Base32(#[from] data_encoding::DecodeError),

    #[error("bad compressed payload")]
    Compression(#[from] std::io::Error),

    #[error("failed to resolve {host}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// An ordered list of hops plus the format version they encode under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnotChain {
    pub version: u8,
    pub knots: Vec<Knot>,
}

impl KnotChain {
    pub fn new(knots: Vec<Knot>) -> Self {
        Self {
            version: VERSION_1,
            knots,
        }
    }
}

/// Serialize a chain: hop counter, tagged knot bodies, elective DEFLATE,
/// and the framing byte.
pub fn tie_chain(chain: &KnotChain) -> Result<Vec<u8>, ChainError> {
    if chain.knots.len() > MAX_KNOTS {
        return Err(ChainError::ChainTooLong(chain.knots.len()));
    }
    let mut body = Vec::new();
    // Current hop is zero at tie time, so the counter byte is the total.
    body.push(chain.knots.len() as u8);
    for k in &chain.knots {
        if let Knot::Domain(d) = k {
            if d.host.len() > 255 {
                return Err(ChainError::DomainTooLong(d.host.len()));
            }
        }
        body.push(k.tag());
        body.extend_from_slice(&k.encode());
    }
    let (body, comp) = try_compress(&body);
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push((comp << 6) | chain.version);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Peel one knot off an encoded chain.
///
/// Returns the untied knot (or `None` once the chain is fully traversed)
/// and the rewritten payload: the peeled knot rotated to the tail with the
/// hop counter advanced. In the terminal case the counter resets instead,
/// reverting the payload to its pristine tied form. The framing byte is
/// copied verbatim, and a compressed payload is re-compressed on output.
pub async fn untie(b: &[u8], stem: &str) -> Result<(Option<Knot>, Vec<u8>), ChainError> {
    let (&frame, rest) = b.split_first().ok_or(ChainError::Insufficient("chain"))?;
    let comp = frame >> 6;
    let version = frame & 0b0011_1111;
    if version != VERSION_1 {
        return Err(ChainError::UnsupportedVersion(version));
    }

    let inflated;
    let body: &[u8] = if comp == COMP_DEFLATE {
        inflated = inflate(rest)?;
        &inflated
    } else {
        rest
    };

    let (&counter, knots) = body.split_first().ok_or(ChainError::Insufficient("chain"))?;
    let current = counter >> 4;
    let total = counter & 0b0000_1111;
    if current > total {
        return Err(ChainError::BadHopCounter(counter));
    }

    let mut new_body = Vec::with_capacity(body.len());
    let next = if current == total {
        // Fully traversed: revert the counter to its pristine state.
        new_body.push(total);
        new_body.extend_from_slice(knots);
        None
    } else {
        let (&tag, rest) = knots.split_first().ok_or(ChainError::Insufficient("chain"))?;
        let next = decode_knot(tag, rest, stem).await?;
        let consumed = next.encoded_len();
        // Rotate the peeled knot to the tail and advance the counter.
        new_body.push(((current + 1) << 4) | total);
        new_body.extend_from_slice(&rest[consumed..]);
        new_body.push(next.tag());
        new_body.extend_from_slice(&next.encode());
        Some(next)
    };

    let mut out = vec![frame];
    if comp == COMP_DEFLATE {
        let mut enc = DeflateEncoder::new(out, Compression::best());
        enc.write_all(&new_body)?;
        out = enc.finish()?;
    } else {
        out.extend_from_slice(&new_body);
    }
    Ok((next, out))
}

async fn decode_knot(tag: u8, b: &[u8], stem: &str) -> Result<Knot, ChainError> {
    match tag {
        knot::TAG_IPV4 => IpKnot::decode_v4(b).map(Knot::Ip),
        knot::TAG_IPV6 => IpKnot::decode_v6(b).map(Knot::Ip),
        knot::TAG_DOMAIN => DomainKnot::decode(b).await.map(Knot::Domain),
        knot::TAG_REFER => ReferKnot::decode(b, stem).map(Knot::Refer),
        other => Err(ChainError::UnknownTag(other)),
    }
}

/// Tie a chain and package it as the first label of a hostname under `stem`.
///
/// Domain knots whose host equals the stem are first replaced by refer
/// knots, eliding the stem from the payload.
pub fn tie_chain_to_hostname(chain: &KnotChain, stem: &str) -> Result<String, ChainError> {
    let bytes = match refer_stem(chain, stem) {
        Some(referred) => tie_chain(&referred)?,
        None => tie_chain(chain)?,
    };
    let host = format!("{LABEL_PREFIX}{}.{stem}", BASE32_DNS.encode(&bytes));
    if host.len() > MAX_HOSTNAME {
        return Err(ChainError::HostnameTooLong(host.len()));
    }
    Ok(host)
}

/// Untie one knot from the chain embedded in `hostname`.
///
/// A hostname whose first label is not a tied chain passes through
/// unchanged with no knot, as does a fully traversed chain (which comes
/// back in its pristine tied form).
pub async fn untie_hostname(hostname: &str) -> Result<(Option<Knot>, String), ChainError> {
    let (label, stem) = hostname.split_once('.').unwrap_or((hostname, ""));
    let Some(encoded) = label.strip_prefix(LABEL_PREFIX) else {
        return Ok((None, hostname.to_owned()));
    };
    let bytes = BASE32_DNS.decode(encoded.as_bytes())?;
    let (next, rewritten) = untie(&bytes, stem).await?;
    let new_host = format!("{LABEL_PREFIX}{}.{stem}", BASE32_DNS.encode(&rewritten));
    if new_host.len() > MAX_HOSTNAME {
        return Err(ChainError::HostnameTooLong(new_host.len()));
    }
    Ok((next, new_host))
}

/// Replace Domain knots matching the stem with Refer knots, if any match.
fn refer_stem(chain: &KnotChain, stem: &str) -> Option<KnotChain> {
    let matches = chain
        .knots
        .iter()
        .any(|k| matches!(k, Knot::Domain(d) if d.host == stem));
    if !matches {
        return None;
    }
    let knots = chain
        .knots
        .iter()
        .map(|k| match k {
            Knot::Domain(d) if d.host == stem => Knot::Refer(ReferKnot::from(d.clone())),
            other => other.clone(),
        })
        .collect();
    Some(KnotChain {
        version: chain.version,
        knots,
    })
}

/// DEFLATE at maximum level; keep the result only when strictly smaller.
fn try_compress(b: &[u8]) -> (Vec<u8>, u8) {
    let mut enc = DeflateEncoder::new(Vec::with_capacity(b.len()), Compression::best());
    if enc.write_all(b).is_err() {
        return (b.to_vec(), COMP_NONE);
    }
    match enc.finish() {
        Ok(compressed) if compressed.len() < b.len() => (compressed, COMP_DEFLATE),
        _ => (b.to_vec(), COMP_NONE),
    }
}

fn inflate(b: &[u8]) -> Result<Vec<u8>, ChainError> {
    let mut out = Vec::new();
    DeflateDecoder::new(b).read_to_end(&mut out)?;
    Ok(out)
}
