//! Shared helpers for integration tests

#![allow(dead_code)]

use tokio::io::{AsyncRead, AsyncReadExt};

/// Assemble a minimal TLS ClientHello record carrying `sni`.
pub fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let mut data = Vec::new();
        data.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        data.push(0x00); // host_name
        data.extend_from_slice(&(name.len() as u16).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        extensions.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&(data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&data);
    }
    extensions.extend_from_slice(&0x000au16.to_be_bytes()); // supported_groups
    extensions.extend_from_slice(&4u16.to_be_bytes());
    extensions.extend_from_slice(&[0x00, 0x02, 0x00, 0x1d]);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0xab; 32]);
    hello.push(0);
    hello.extend_from_slice(&2u16.to_be_bytes());
    hello.extend_from_slice(&[0x13, 0x01]);
    hello.push(1);
    hello.push(0);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.push((hello.len() >> 16) as u8);
    handshake.push((hello.len() >> 8) as u8);
    handshake.push(hello.len() as u8);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Extract the SNI from a ClientHello record built the same way.
pub fn sni_of(record: &[u8]) -> Option<String> {
    // extensions start after: record(5) + hs(4) + ver(2) + random(32)
    // + sid(1+0) + ciphers(2+2) + comp(1+1)
    let mut p = 5 + 4 + 2 + 32 + 1 + 4 + 2;
    let ext_total = u16::from_be_bytes([record[p], record[p + 1]]) as usize;
    p += 2;
    let end = p + ext_total;
    while p + 4 <= end {
        let ext_type = u16::from_be_bytes([record[p], record[p + 1]]);
        let ext_len = u16::from_be_bytes([record[p + 2], record[p + 3]]) as usize;
        p += 4;
        if ext_type == 0 {
            let name_len = u16::from_be_bytes([record[p + 3], record[p + 4]]) as usize;
            let name = &record[p + 5..p + 5 + name_len];
            return Some(String::from_utf8(name.to_vec()).unwrap());
        }
        p += ext_len;
    }
    None
}

/// Read an HTTP request head (through the terminating blank line).
pub async fn read_http_head<R>(stream: &mut R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
        assert!(head.len() < 16 * 1024, "unterminated HTTP head");
    }
    String::from_utf8(head).unwrap()
}

/// The base32 flavor chains travel in: lowercase RFC 4648, no padding.
pub fn base32_dns() -> data_encoding::Encoding {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().unwrap()
}

/// Decode the chain payload out of a `q--<label>.<stem>` hostname.
pub fn payload_of(hostname: &str) -> Vec<u8> {
    let label = hostname.split('.').next().unwrap();
    let encoded = label.strip_prefix("q--").expect("not a tied hostname");
    base32_dns().decode(encoded.as_bytes()).unwrap()
}
