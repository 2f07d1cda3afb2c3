//! Sniffer rewrite tests against real tied chains

mod common;

use common::{build_client_hello, sni_of};
use knotroute::chain::{tie_chain_to_hostname, IpKnot, Knot, KnotChain};
use knotroute::sniff::{self, tls, Protocol};
use tokio::io::BufReader;

fn one_hop_hostname(addr: &str, port: u16, stem: &str) -> String {
    let chain = KnotChain::new(vec![Knot::Ip(IpKnot::new(addr.parse().unwrap(), port))]);
    tie_chain_to_hostname(&chain, stem).unwrap()
}

#[tokio::test]
async fn http_host_is_untied_and_rewritten() {
    let hostname = one_hop_hostname("1.2.3.4", 80, "foo.example");
    let request = format!("GET / HTTP/1.1\r\nHost: {hostname}:443\r\nAccept: */*\r\n\r\n");

    let mut reader = BufReader::new(request.as_bytes());
    let sniffed = sniff::sniff_plain(&mut reader).await.unwrap();

    assert_eq!(sniffed.protocol, Protocol::Http);
    let knot = sniffed.next.expect("one knot to untie");
    assert_eq!(knot.to_string(), "1.2.3.4:80");

    let head = String::from_utf8(sniffed.prefix).unwrap();
    let host_line = head
        .lines()
        .find(|l| l.starts_with("Host: "))
        .expect("host header survives");
    assert!(host_line.starts_with("Host: q--"));
    assert!(host_line.ends_with(".foo.example:443"));
    assert_ne!(host_line, format!("Host: {hostname}:443"));
    // The rest of the head is untouched.
    assert!(head.starts_with("GET / HTTP/1.1\r\n"));
    assert!(head.contains("Accept: */*\r\n"));
}

#[tokio::test]
async fn absolute_uri_authority_is_rewritten() {
    let hostname = one_hop_hostname("1.2.3.4", 80, "foo.example");
    let request =
        format!("GET http://{hostname}:8080/path?q=1 HTTP/1.1\r\nHost: {hostname}:8080\r\n\r\n");

    let mut reader = BufReader::new(request.as_bytes());
    let sniffed = sniff::sniff_plain(&mut reader).await.unwrap();
    assert!(sniffed.next.is_some());

    let head = String::from_utf8(sniffed.prefix).unwrap();
    let request_line = head.lines().next().unwrap();
    assert!(request_line.starts_with("GET http://q--"));
    assert!(request_line.ends_with(".foo.example:8080/path?q=1 HTTP/1.1"));
}

#[tokio::test]
async fn socks5_domain_is_untied_and_reframed() {
    let hostname = one_hop_hostname("9.9.9.9", 1080, "svc.example");
    let mut request = vec![0x05, 0x01, 0x00, 0x03, hostname.len() as u8];
    request.extend_from_slice(hostname.as_bytes());
    request.extend_from_slice(&443u16.to_be_bytes());

    let mut reader = BufReader::new(request.as_slice());
    let sniffed = sniff::sniff_plain(&mut reader).await.unwrap();

    assert_eq!(sniffed.protocol, Protocol::Socks5);
    assert_eq!(sniffed.next.unwrap().to_string(), "9.9.9.9:1080");

    let prefix = sniffed.prefix;
    assert_eq!(&prefix[..4], &[0x05, 0x01, 0x00, 0x03]);
    let len = prefix[4] as usize;
    let rewritten = std::str::from_utf8(&prefix[5..5 + len]).unwrap();
    assert!(rewritten.starts_with("q--"));
    assert!(rewritten.ends_with(".svc.example"));
    assert_eq!(
        u16::from_be_bytes([prefix[5 + len], prefix[6 + len]]),
        443
    );
}

#[tokio::test]
async fn socks4a_hostname_is_untied_and_reframed() {
    let hostname = one_hop_hostname("9.9.9.9", 1080, "svc.example");
    let mut request = vec![0x04, 0x01, 0x01, 0xbb, 0, 0, 0, 1];
    request.extend_from_slice(b"ident\0");
    request.extend_from_slice(hostname.as_bytes());
    request.push(0);

    let mut reader = BufReader::new(request.as_slice());
    let sniffed = sniff::sniff_plain(&mut reader).await.unwrap();

    assert_eq!(sniffed.protocol, Protocol::Socks4);
    assert_eq!(sniffed.next.unwrap().to_string(), "9.9.9.9:1080");

    let prefix = sniffed.prefix;
    assert_eq!(&prefix[..8], &[0x04, 0x01, 0x01, 0xbb, 0, 0, 0, 1]);
    let tail = &prefix[8..];
    assert!(tail.starts_with(b"ident\0"));
    let rewritten = std::str::from_utf8(&tail[6..tail.len() - 1]).unwrap();
    assert!(rewritten.starts_with("q--"));
    assert!(rewritten.ends_with(".svc.example"));
}

#[tokio::test]
async fn tls_sni_terminal_chain_rewrites_to_the_pristine_label() {
    // An empty chain unties straight to the terminal state.
    let hostname = tie_chain_to_hostname(&KnotChain::new(Vec::new()), "stem.example").unwrap();
    let record = build_client_hello(Some(&hostname));

    let mut reader = record.as_slice();
    let sniffed = tls::sniff_client_hello(&mut reader).await.unwrap();
    assert_eq!(sniffed.protocol, Protocol::Tls);
    assert!(sniffed.next.is_none());
    assert_eq!(sniffed.prefix, record);
    assert_eq!(sni_of(&sniffed.prefix).unwrap(), hostname);
}

#[tokio::test]
async fn tls_sni_chain_is_untied_with_lengths_recomputed() {
    let hostname = one_hop_hostname("1.2.3.4", 443, "stem.example");
    let record = build_client_hello(Some(&hostname));

    let mut reader = record.as_slice();
    let sniffed = tls::sniff_client_hello(&mut reader).await.unwrap();
    assert_eq!(sniffed.next.unwrap().to_string(), "1.2.3.4:443");

    let sni = sni_of(&sniffed.prefix).unwrap();
    assert!(sni.starts_with("q--"));
    assert!(sni.ends_with(".stem.example"));
    // Same payload size either side of the rotation, so the record length
    // is preserved too.
    assert_eq!(sniffed.prefix.len(), record.len());
}
