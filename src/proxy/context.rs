use bytes::Bytes;
use http::{HeaderMap, Method};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

use crate::config::MetadataHeaderNames;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// One client request being carried through the plugin chain and fetch
/// engine, scoped to a single fixed origin per request.
pub struct ProxyTransaction {
    pub method: Method,
    pub uri_path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Host as the client addressed it (the `Host` header, or CONNECT target).
    pub inbound_origin: String,
    /// Host actually fetched — may diverge from `inbound_origin` when a
    /// plugin rewrites the destination in `request_handler`.
    pub outbound_origin: String,
    pub scheme: &'static str,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub fetch_start: Option<Instant>,
}

impl ProxyTransaction {
    pub fn new(
        method: Method,
        uri_path: String,
        headers: HeaderMap,
        body: Bytes,
        inbound_origin: String,
        scheme: &'static str,
        client_ip: IpAddr,
    ) -> Self {
        let outbound_origin = inbound_origin.clone();
        Self {
            method,
            uri_path,
            headers,
            body,
            inbound_origin,
            outbound_origin,
            scheme,
            client_ip,
            start: Instant::now(),
            fetch_start: None,
        }
    }

    pub fn origin_changed(&self) -> bool {
        self.outbound_origin != self.inbound_origin
    }

    /// Full URL this transaction will be fetched from, honoring any
    /// plugin-driven origin rewrite.
    pub fn fetch_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.outbound_origin, self.uri_path)
    }

    /// Record the access-log line and per-transaction metrics. Called once
    /// per transaction regardless of outcome.
    pub fn finalize(&self, status: u16) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            method = %self.method,
            host = %self.outbound_origin,
            path = %self.uri_path,
            status,
            upstream = %self.outbound_origin,
            latency_ms = elapsed_ms,
            "request complete"
        );

        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "proxy_requests_total",
            "method" => self.method.to_string(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!("proxy_request_duration_seconds")
            .record(self.start.elapsed().as_secs_f64());

        if let Some(fetch_start) = self.fetch_start {
            metrics::histogram!("proxy_fetch_duration_seconds")
                .record(fetch_start.elapsed().as_secs_f64());
        }
    }
}

/// Strip the reserved metadata headers from a header map before it is
/// forwarded onward — these are an in-band plugin<->coordinator control
/// channel and must never reach the client or the origin.
pub fn strip_metadata_headers(headers: &mut HeaderMap, names: &MetadataHeaderNames) {
    for name in names.all_lower() {
        if let Ok(header_name) = http::HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(header_name);
        }
    }
}

/// Hop-by-hop headers that must never be forwarded between the client and
/// the origin (RFC 7230 §6.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_transaction() -> ProxyTransaction {
        ProxyTransaction::new(
            Method::GET,
            "/path".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            "example.com".to_string(),
            "https",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    #[test]
    fn fetch_url_uses_outbound_origin() {
        let mut tx = sample_transaction();
        assert_eq!(tx.fetch_url(), "https://example.com/path");
        tx.outbound_origin = "redirected.example.com".to_string();
        assert!(tx.origin_changed());
        assert_eq!(tx.fetch_url(), "https://redirected.example.com/path");
    }

    #[test]
    fn strip_hop_by_hop_removes_connection_and_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        strip_hop_by_hop_headers(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("upgrade"));
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn strip_metadata_headers_removes_configured_names() {
        let names = MetadataHeaderNames::default();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::HeaderName::from_bytes(names.override_host_header.as_bytes()).unwrap(),
            HeaderValue::from_static("internal.example.com"),
        );
        strip_metadata_headers(&mut headers, &names);
        assert!(headers.is_empty());
    }
}
