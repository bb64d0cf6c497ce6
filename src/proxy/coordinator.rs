use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use hyper::body::Incoming;

use crate::codec::{decode_content_body, encode_content_body, ContentEncoding};
use crate::fetch;
use crate::loop_detect::is_reverse_proxy_loop;
use crate::plugin::{dispatch_request_chain, dispatch_response_chain, PluginSignal};
use crate::proxy::context::{
    empty_body, full_body, strip_hop_by_hop_headers, strip_metadata_headers, BoxBody,
    ProxyTransaction,
};
use crate::proxy::trace;
use crate::server::state::ProxyState;

/// Outcome of running a transaction through the coordinator: write a
/// response, or close the connection silently (a plugin demanded
/// `DropConnection`, or the request failed validation and is simply
/// dropped with no response written).
pub enum Outcome {
    Respond(Response<BoxBody>),
    CloseSilently,
}

/// Handle one plain HTTP (or TLS-terminated, post-interception) request:
/// validate, run the request-phase plugin chain, fetch the origin (unless
/// a plugin skipped it), run the response-phase plugin chain, re-encode,
/// and produce the outcome to write back to the client.
pub async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    client_ip: IpAddr,
    is_ssl: bool,
) -> Outcome {
    let (parts, body) = req.into_parts();

    if parts.uri.path() == state.config.proxy_self_url {
        return serve_ca_cert(&state).await;
    }

    if !state.config.allow_invalid && !is_valid_request(&parts.method, &parts.uri, &parts.headers) {
        tracing::debug!(peer = %client_ip, "dropping invalid request");
        return Outcome::CloseSilently;
    }

    let body_bytes = match http_body_util::BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return Outcome::CloseSilently;
        }
    };

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let scheme = if is_ssl { "https" } else { "http" };
    let mut headers = parts.headers.clone();
    if !headers.contains_key(http::header::HOST) {
        headers.insert(http::header::HOST, HeaderValue::from_str(&host).unwrap_or(HeaderValue::from_static("")));
    }

    let mut tx = ProxyTransaction::new(
        parts.method.clone(),
        parts.uri.path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string()),
        headers,
        body_bytes.clone(),
        host,
        scheme,
        client_ip,
    );

    if trace::enabled(state.config.debug, state.config.trace) {
        trace::dump_request(parts.method.as_str(), &tx.uri_path, &tx.headers, &body_bytes);
    }

    let request_outcome =
        match dispatch_request_chain(&state.plugins, &mut tx, body_bytes, state.config.debug).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "plugin request_handler aborted transaction");
                return Outcome::CloseSilently;
            }
        };

    match request_outcome.signal {
        PluginSignal::DropConnection => {
            metrics::counter!("proxy_plugin_drop_connection_total").increment(1);
            tracing::info!(host = %tx.outbound_origin, "plugin demanded DropConnection");
            return Outcome::CloseSilently;
        }
        PluginSignal::DontFetchResponse => {
            tracing::debug!("plugin demanded DontFetchResponse, skipping origin fetch");
            return match finish_without_fetch(&state, &mut tx).await {
                Some(resp) => {
                    tx.finalize(resp.status().as_u16());
                    Outcome::Respond(resp)
                }
                None => Outcome::CloseSilently,
            };
        }
        PluginSignal::Continue => {}
    }

    if request_outcome.altered {
        tx.headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&request_outcome.body.len().to_string()).unwrap(),
        );
    }

    resolve_target(&mut tx);

    if tx.origin_changed() {
        tracing::info!(from = %tx.inbound_origin, to = %tx.outbound_origin, "plugin redirected request to a different origin");
    }

    if let Some(override_host) = tx
        .headers
        .get(state.config.metadata_headers.override_host_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        tracing::debug!(host = override_host, "plugin overrode outgoing Host via metadata header");
        tx.outbound_origin = override_host.clone();
        if let Ok(value) = HeaderValue::from_str(&override_host) {
            tx.headers.insert(http::header::HOST, value);
        }
    }

    if let Some(resolved_ip) = state.resolve_origin_ip(&tx.outbound_origin).await {
        if is_reverse_proxy_loop(
            &tx.outbound_origin,
            &tx.inbound_origin,
            resolved_ip,
            &state.local_addresses,
        ) {
            metrics::counter!("proxy_loop_detected_total").increment(1);
            tracing::error!(peer = %client_ip, host = %tx.outbound_origin, "reverse-proxy loop detected");
            let resp = Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(http::header::CONNECTION, "close")
                .body(empty_body())
                .unwrap();
            tx.finalize(500);
            return Outcome::Respond(resp);
        }
    }

    let ignore_decompression_errors = tx
        .headers
        .contains_key(state.config.metadata_headers.ignore_response_decompression_errors.as_str());

    let mut fetch_headers = tx.headers.clone();
    strip_metadata_headers(&mut fetch_headers, &state.config.metadata_headers);
    strip_hop_by_hop_headers(&mut fetch_headers);

    tx.fetch_start = Some(std::time::Instant::now());
    let url = tx.fetch_url();
    let fetched = match fetch::fetch(&state.fetch_client, tx.method.clone(), &url, fetch_headers, request_outcome.body).await {
        Ok(f) => f,
        Err(crate::error::ProxyError::UpstreamTimeout) | Err(crate::error::ProxyError::RemoteDisconnected) => {
            tracing::warn!(url, "origin fetch timed out or remote disconnected, closing silently");
            return Outcome::CloseSilently;
        }
        Err(e) => {
            tracing::error!(error = %e, url, "origin fetch failed");
            let resp = Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header(http::header::CONNECTION, "close")
                .body(empty_body())
                .unwrap();
            tx.finalize(502);
            return Outcome::Respond(resp);
        }
    };

    let content_encoding = if ignore_decompression_errors {
        ContentEncoding::Identity
    } else {
        fetched
            .headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(ContentEncoding::from_header_value)
            .unwrap_or(ContentEncoding::Identity)
    };

    let decoded_body = if ignore_decompression_errors {
        fetched.body.to_vec()
    } else {
        decode_content_body(&fetched.body, content_encoding)
    };

    let mut response_headers = fetched.headers.clone();
    let response_outcome = match dispatch_response_chain(
        &state.plugins,
        &tx,
        fetched.status,
        &mut response_headers,
        Bytes::from(decoded_body),
        state.config.debug,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "plugin response_handler aborted transaction");
            return Outcome::CloseSilently;
        }
    };

    let final_encoding = negotiate_response_encoding(
        &tx.headers,
        &response_headers,
        content_encoding,
        ignore_decompression_errors,
        &state.config.metadata_headers.override_response_content_encoding,
    );

    let encoded_body = if reuse_origin_wire_bytes(response_outcome.altered, final_encoding, content_encoding) {
        fetched.body.to_vec()
    } else {
        encode_content_body(&response_outcome.body, final_encoding)
    };

    response_headers.remove(http::header::CONTENT_LENGTH);
    response_headers.remove(http::header::CONTENT_ENCODING);
    response_headers.remove(http::header::TRANSFER_ENCODING);
    response_headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&encoded_body.len().to_string()).unwrap(),
    );
    response_headers.insert(
        http::header::CONTENT_ENCODING,
        HeaderValue::from_static(final_encoding.as_header_value()),
    );
    strip_metadata_headers(&mut response_headers, &state.config.metadata_headers);
    strip_hop_by_hop_headers(&mut response_headers);

    if trace::enabled(state.config.debug, state.config.trace) {
        trace::dump_response(fetched.status, &response_headers, &Bytes::from(encoded_body.clone()));
    }

    metrics::histogram!("proxy_response_size_bytes").record(encoded_body.len() as f64);

    let status =
        StatusCode::from_u16(fetched.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }
    let resp = builder.body(full_body(encoded_body)).unwrap();

    tx.finalize(status.as_u16());
    Outcome::Respond(resp)
}

/// Build the placeholder response used when a plugin demanded
/// `DontFetchResponse` — the response phase still runs so a plugin can
/// populate a body, but no origin was contacted.
async fn finish_without_fetch(state: &ProxyState, tx: &mut ProxyTransaction) -> Option<Response<BoxBody>> {
    let mut headers = HeaderMap::new();
    let outcome = match dispatch_response_chain(
        &state.plugins,
        tx,
        200,
        &mut headers,
        Bytes::new(),
        state.config.debug,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "plugin response_handler aborted DontFetchResponse transaction");
            return None;
        }
    };

    // No origin was fetched, so there's no pre-encoded wire body to reuse —
    // the body a plugin populated is plaintext, i.e. effectively `identity`
    // encoded, until RENEGOTIATE_ENC runs the same encode/negotiate pass
    // `handle_request` runs after a real fetch.
    let final_encoding = negotiate_response_encoding(
        &tx.headers,
        &headers,
        ContentEncoding::Identity,
        false,
        &state.config.metadata_headers.override_response_content_encoding,
    );
    let encoded_body = encode_content_body(&outcome.body, final_encoding);

    headers.remove(http::header::CONTENT_LENGTH);
    headers.remove(http::header::CONTENT_ENCODING);
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_str(&encoded_body.len().to_string()).unwrap(),
    );
    headers.insert(
        http::header::CONTENT_ENCODING,
        HeaderValue::from_static(final_encoding.as_header_value()),
    );
    strip_metadata_headers(&mut headers, &state.config.metadata_headers);
    strip_hop_by_hop_headers(&mut headers);

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    Some(builder.body(full_body(encoded_body)).unwrap())
}

/// Validate that method, path, and every header name/value is printable
/// ASCII, checking the request actually passed in rather than any
/// ambient/shared state.
fn is_valid_request(method: &Method, uri: &http::Uri, headers: &HeaderMap) -> bool {
    let printable = |s: &str| s.bytes().all(|b| (0x20..0x7f).contains(&b));

    if !printable(method.as_str()) {
        return false;
    }
    if !printable(uri.path()) {
        return false;
    }
    for (name, value) in headers {
        if !printable(name.as_str()) {
            return false;
        }
        if let Ok(v) = value.to_str() {
            if !printable(v) {
                return false;
            }
        } else {
            return false;
        }
    }
    true
}

/// True when the response can ship upstream's exact wire bytes instead of
/// decompressing and recompressing the plaintext: no plugin touched the
/// body, and the encoding served to the client matches what the origin
/// sent, so a fresh compress pass would only risk producing different
/// (but equivalent) bytes than what was actually received.
fn reuse_origin_wire_bytes(
    altered: bool,
    final_encoding: ContentEncoding,
    origin_encoding: ContentEncoding,
) -> bool {
    !altered && final_encoding == origin_encoding
}

/// RESOLVE_TARGET: a request-phase plugin demands a redirect by rewriting
/// `req.path` to an absolute-form URL, not by poking a separate field — the
/// coordinator notices by parsing whatever path the plugin chain left
/// behind. When the parsed authority is non-empty and differs from the
/// inbound origin, it becomes the new `outbound_origin`/`scheme` and
/// `uri_path` collapses back down to just the path-and-query so
/// `fetch_url` composes cleanly against it.
fn resolve_target(tx: &mut ProxyTransaction) {
    let path = tx.uri_path.as_str();

    let (scheme, rest) = if let Some(rest) = path.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = path.strip_prefix("http://") {
        ("http", rest)
    } else {
        return;
    };

    let (netloc, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    // The path always collapses back to path-and-query once it was an
    // absolute-form URL, whether or not the host actually changed — the
    // original achieves this for free by substituting in place on the whole
    // URL string (`req_path_full.replace(netloc, outbound_origin)`), which
    // is a no-op when the netloc already matches.
    tx.uri_path = path_and_query.to_string();

    if netloc.len() <= 1 || netloc == tx.inbound_origin {
        return;
    }

    tx.outbound_origin = netloc.to_string();
    tx.scheme = scheme;
}

/// Negotiate the Content-Encoding to re-encode the response body with,
/// based on the client's `Accept-Encoding` and what the origin sent.
fn negotiate_response_encoding(
    request_headers: &HeaderMap,
    response_headers: &HeaderMap,
    origin_encoding: ContentEncoding,
    ignore_decompression_errors: bool,
    override_header_name: &str,
) -> ContentEncoding {
    if ignore_decompression_errors {
        return ContentEncoding::Identity;
    }

    let Some(accept_encoding) = request_headers
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    else {
        return origin_encoding;
    };

    if let Some(override_value) = response_headers
        .get(override_header_name)
        .and_then(|v| v.to_str().ok())
    {
        tracing::debug!("plugin overrode response content encoding without changing the header value");
        return ContentEncoding::from_header_value(override_value);
    }

    let candidates: Vec<&str> = accept_encoding.split(',').map(str::trim).collect();
    let origin_value = origin_encoding.as_header_value();
    if candidates.iter().any(|c| *c == origin_value) {
        return origin_encoding;
    }

    for candidate in &candidates {
        let enc = ContentEncoding::from_header_value(candidate);
        if enc.as_header_value() == *candidate {
            return enc;
        }
    }

    tracing::warn!(
        origin_encoding = origin_value,
        accept_encoding,
        "origin encoding not acceptable to client and no supported alternative found; response will be mis-encoded"
    );
    origin_encoding
}

/// Serve the CA certificate at the configured self-URL so clients can
/// install it as a trusted root.
async fn serve_ca_cert(state: &ProxyState) -> Outcome {
    match state.cert_issuer.read_ca_cert().await {
        Ok(bytes) => {
            let resp = Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "application/x-x509-ca-cert")
                .header(http::header::CONNECTION, "close")
                .body(full_body(bytes))
                .unwrap();
            Outcome::Respond(resp)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read CA certificate");
            let resp = Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(empty_body())
                .unwrap();
            Outcome::Respond(resp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_valid_request_rejects_non_printable_path() {
        let headers = HeaderMap::new();
        assert!(!is_valid_request(
            &Method::GET,
            &"/\u{0}bad".parse().unwrap(),
            &headers
        ));
    }

    #[test]
    fn is_valid_request_accepts_normal_request() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        assert!(is_valid_request(
            &Method::GET,
            &"/index.html".parse().unwrap(),
            &headers
        ));
    }

    #[test]
    fn is_valid_request_rejects_tab_in_header_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-custom",
            HeaderValue::from_bytes(b"has\ttab").unwrap(),
        );
        assert!(!is_valid_request(
            &Method::GET,
            &"/index.html".parse().unwrap(),
            &headers
        ));
    }

    fn sample_tx(uri_path: &str) -> ProxyTransaction {
        ProxyTransaction::new(
            Method::GET,
            uri_path.to_string(),
            HeaderMap::new(),
            Bytes::new(),
            "inbound.example.com".to_string(),
            "http",
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        )
    }

    #[test]
    fn resolve_target_leaves_origin_form_path_untouched() {
        let mut tx = sample_tx("/some/path?x=1");
        resolve_target(&mut tx);
        assert!(!tx.origin_changed());
        assert_eq!(tx.uri_path, "/some/path?x=1");
    }

    #[test]
    fn resolve_target_redirects_on_absolute_url_with_different_host() {
        let mut tx = sample_tx("https://real.example.com/path?q=1");
        resolve_target(&mut tx);
        assert!(tx.origin_changed());
        assert_eq!(tx.outbound_origin, "real.example.com");
        assert_eq!(tx.uri_path, "/path?q=1");
        assert_eq!(tx.scheme, "https");
    }

    #[test]
    fn resolve_target_collapses_path_even_when_host_matches_inbound_origin() {
        let mut tx = sample_tx("http://inbound.example.com/path");
        resolve_target(&mut tx);
        assert!(!tx.origin_changed());
        assert_eq!(tx.uri_path, "/path");
        assert_eq!(tx.outbound_origin, "inbound.example.com");
    }

    #[test]
    fn resolve_target_handles_absolute_url_with_no_path() {
        let mut tx = sample_tx("http://real.example.com");
        resolve_target(&mut tx);
        assert_eq!(tx.outbound_origin, "real.example.com");
        assert_eq!(tx.uri_path, "/");
    }

    #[test]
    fn negotiate_prefers_origin_encoding_when_accepted() {
        let mut req_headers = HeaderMap::new();
        req_headers.insert("accept-encoding", HeaderValue::from_static("gzip, br"));
        let resp_headers = HeaderMap::new();
        let enc = negotiate_response_encoding(
            &req_headers,
            &resp_headers,
            ContentEncoding::Gzip,
            false,
            "x-proxy2-override-response-encoding",
        );
        assert_eq!(enc.as_header_value(), "gzip");
    }

    #[test]
    fn negotiate_falls_back_to_supported_alternative() {
        let mut req_headers = HeaderMap::new();
        req_headers.insert("accept-encoding", HeaderValue::from_static("br"));
        let resp_headers = HeaderMap::new();
        let enc = negotiate_response_encoding(
            &req_headers,
            &resp_headers,
            ContentEncoding::Gzip,
            false,
            "x-proxy2-override-response-encoding",
        );
        assert_eq!(enc.as_header_value(), "br");
    }

    #[test]
    fn reuse_origin_wire_bytes_when_untouched_and_encoding_unchanged() {
        assert!(reuse_origin_wire_bytes(false, ContentEncoding::Gzip, ContentEncoding::Gzip));
    }

    #[test]
    fn does_not_reuse_wire_bytes_when_plugin_altered_body() {
        assert!(!reuse_origin_wire_bytes(true, ContentEncoding::Gzip, ContentEncoding::Gzip));
    }

    #[test]
    fn does_not_reuse_wire_bytes_when_encoding_is_renegotiated() {
        assert!(!reuse_origin_wire_bytes(false, ContentEncoding::Brotli, ContentEncoding::Gzip));
    }

    #[test]
    fn negotiate_applies_override_when_client_sent_accept_encoding() {
        let mut req_headers = HeaderMap::new();
        req_headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(
            "x-proxy2-override-response-encoding",
            HeaderValue::from_static("br"),
        );
        let enc = negotiate_response_encoding(
            &req_headers,
            &resp_headers,
            ContentEncoding::Gzip,
            false,
            "x-proxy2-override-response-encoding",
        );
        assert_eq!(enc.as_header_value(), "br");
    }

    #[test]
    fn negotiate_ignores_override_when_client_sent_no_accept_encoding() {
        let req_headers = HeaderMap::new();
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(
            "x-proxy2-override-response-encoding",
            HeaderValue::from_static("br"),
        );
        let enc = negotiate_response_encoding(
            &req_headers,
            &resp_headers,
            ContentEncoding::Gzip,
            false,
            "x-proxy2-override-response-encoding",
        );
        assert_eq!(enc, ContentEncoding::Gzip);
    }

    #[test]
    fn negotiate_ignores_accept_encoding_when_decompression_errors_ignored() {
        let mut req_headers = HeaderMap::new();
        req_headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        let resp_headers = HeaderMap::new();
        let enc = negotiate_response_encoding(
            &req_headers,
            &resp_headers,
            ContentEncoding::Gzip,
            true,
            "x-proxy2-override-response-encoding",
        );
        assert_eq!(enc, ContentEncoding::Identity);
    }
}
