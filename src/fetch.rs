use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::{HeaderMap, Method};

use crate::error::ProxyError;

/// Caps the amount of origin response body buffered in memory per
/// transaction. Responses are fully buffered end-to-end (no streaming to
/// the client), so an unbounded origin is otherwise a memory exhaustion
/// vector.
pub const MAX_RESPONSE_BODY_BYTES: usize = 150 * 1024 * 1024;

/// A fetched origin response, already drained into memory.
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Build the client used for every origin fetch. TLS verification and
/// redirect following are disabled here, scoped to this one `Client`
/// instance — never process-wide. Redirects are surfaced to the
/// coordinator as plain 3xx responses so the plugin chain sees them,
/// rather than being followed transparently.
pub fn build_fetch_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .build()
        .expect("failed to build fetch client")
}

/// Fetch a single origin request: one attempt, no transparent retries
/// (retrying a MITM'd request could replay side effects on the origin).
pub async fn fetch(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<FetchedResponse, ProxyError> {
    let response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            metrics::counter!("proxy_requests_total", "outcome" => "fetch_error").increment(1);
            ProxyError::from(e)
        })?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();

    // Streamed so an origin that lies about Content-Length (or has none)
    // can't force a multi-hundred-MB allocation before the cap is checked:
    // the connection is aborted the moment the running total goes over.
    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        if body.len() + chunk.len() > MAX_RESPONSE_BODY_BYTES {
            return Err(ProxyError::UpstreamUnreachable(format!(
                "response body exceeds the {} byte cap",
                MAX_RESPONSE_BODY_BYTES
            )));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(FetchedResponse {
        status,
        headers,
        body: body.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_client_builds_with_redirects_disabled() {
        let client = build_fetch_client(Duration::from_secs(5));
        // Building succeeds; behavioral redirect/tls properties are exercised
        // indirectly via integration tests against a live listener.
        drop(client);
    }
}
