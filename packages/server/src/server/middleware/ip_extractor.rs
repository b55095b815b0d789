//! Client IP extraction for rate limiting and webhook provenance.
//!
//! The extracted address keys the shared per-IP rate-limit buckets and is
//! stored on webhook event rows, so it must not be client-chosen. The
//! service runs behind a single trusted edge proxy: only the last
//! X-Forwarded-For entry (the hop the edge appended) is honored; anything
//! earlier in the list arrived from the wire and can be forged.

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};

/// Extension carrying the resolved client address.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Last entry of a comma-separated X-Forwarded-For list.
fn edge_forwarded_ip(header: &str) -> Option<IpAddr> {
    header
        .rsplit(',')
        .next()
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

pub async fn extract_client_ip(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(edge_forwarded_ip);

    // Direct connections (local runs, health probes) have no proxy hop.
    let ip = forwarded.unwrap_or_else(|| addr.ip());
    request.extensions_mut().insert(ClientIp(ip));

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_the_edge_appended_hop_not_the_client_claim() {
        // A spoofing client sends its own X-Forwarded-For; the edge appends
        // the real peer address last.
        let ip = edge_forwarded_ip("1.2.3.4, 10.0.0.7").unwrap();
        assert_eq!(ip.to_string(), "10.0.0.7");
    }

    #[test]
    fn single_entry_lists_parse() {
        let ip = edge_forwarded_ip("203.0.113.9").unwrap();
        assert_eq!(ip.to_string(), "203.0.113.9");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(edge_forwarded_ip("not-an-ip").is_none());
        assert!(edge_forwarded_ip("").is_none());
    }
}
