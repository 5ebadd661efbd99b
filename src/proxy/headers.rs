use std::net::IpAddr;
use std::time::SystemTime;

use http::HeaderMap;
use http::header::{DATE, HeaderName, HeaderValue, VIA};

/// Hop-by-hop fields, RFC 7230 section 6.1. Scrubbed from both the upstream
/// request and the stored/forwarded response.
const PER_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_per_hop(headers: &mut HeaderMap) {
    for name in PER_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Appends this proxy to the Via chain. The protocol version drops its
/// leading `HTTP/`, leaving `1.1 proxy.example (cachet)`.
pub fn append_via(headers: &mut HeaderMap, proto: &str, name: &str) {
    let hop = format!("{proto} {name} (cachet)");
    let hop = hop.strip_prefix("HTTP/").unwrap_or(&hop);

    let mut chain = String::new();
    for value in headers.get_all(VIA) {
        if let Ok(text) = value.to_str() {
            if !chain.is_empty() {
                chain.push_str(", ");
            }
            chain.push_str(text);
        }
    }
    if !chain.is_empty() {
        chain.push_str(", ");
    }
    chain.push_str(hop);

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(VIA, value);
    }
}

/// Folds any prior X-Forwarded-For values into one list and appends the
/// connecting client's address.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let name = HeaderName::from_static("x-forwarded-for");
    let mut list = String::new();
    for value in headers.get_all(&name) {
        if let Ok(text) = value.to_str() {
            if !list.is_empty() {
                list.push_str(", ");
            }
            list.push_str(text);
        }
    }
    if !list.is_empty() {
        list.push_str(", ");
    }
    list.push_str(&client_ip.to_string());

    if let Ok(value) = HeaderValue::from_str(&list) {
        headers.insert(name, value);
    }
}

/// Responses without a Date get the reception time, RFC 1123 formatted, so
/// later freshness arithmetic on the stored entry is well-defined.
pub fn ensure_date(headers: &mut HeaderMap, received: SystemTime) {
    if headers.contains_key(DATE) {
        return;
    }
    let formatted = httpdate::fmt_http_date(received);
    if let Ok(value) = HeaderValue::from_str(&formatted) {
        headers.insert(DATE, value);
    }
}
