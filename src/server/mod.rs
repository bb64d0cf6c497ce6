mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::ProxyState;

use crate::proxy::context::{empty_body, BoxBody};
use crate::proxy::coordinator::{self, Outcome};
use anyhow::Result;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// True when the client's CONNECT carried `Proxy-Connection: close`, which
/// per spec arms `no_keep_alive` on the tunnel this CONNECT sets up. Any
/// other value (including absence) leaves keep-alive on for ≥HTTP/1.1.
fn proxy_connection_requests_close(req: &Request<Incoming>) -> bool {
    req.headers()
        .get("proxy-connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// Resolve the `host:port` to dial for a CONNECT target, defaulting the
/// port to 443 when it's missing *or* when it parses as 0 (e.g. `host:0`).
fn resolve_connect_target_port(target: &str) -> String {
    let (host, port) = target.split_once(':').unwrap_or((target, ""));
    match port.parse::<u16>() {
        Ok(0) | Err(_) => format!("{host}:443"),
        Ok(p) => format!("{host}:{p}"),
    }
}

/// Run the main proxy server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections and
/// waits up to `DRAIN_TIMEOUT` for in-flight requests to complete before
/// forcibly dropping them.
pub async fn run_proxy_server(
    listen: &str,
    state: Arc<ProxyState>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    let in_flight = Arc::new(tokio::sync::Semaphore::new(0));
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("proxy_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("proxy_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("proxy_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        in_flight.add_permits(1);
        let in_flight = in_flight.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let closer = Arc::new(Notify::new());
            let svc = service_fn({
                let state = state.clone();
                let closer = closer.clone();
                move |req: Request<Incoming>| {
                    let state = state.clone();
                    let closer = closer.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            serve_one(state, req, peer_addr, false, closer).await,
                        )
                    }
                }
            });

            let conn = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc);

            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        if !e.to_string().contains("connection closed") {
                            error!(
                                "server: proxy: connection error, peer={}, error={}",
                                peer_addr, e
                            );
                        }
                    }
                }
                _ = closer.notified() => {
                    tracing::debug!(peer = %peer_addr, "server: proxy: dropping connection silently");
                }
            }

            metrics::gauge!("proxy_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
            let _ = in_flight.acquire().await;
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: proxy: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Dispatch one request: CONNECT is routed to the TLS interception/relay
/// path before hitting the coordinator; everything else runs the normal
/// request lifecycle. `is_ssl` is true when this request arrived over a
/// connection this process itself terminated via CONNECT interception.
///
/// `Outcome::CloseSilently` must put zero bytes on the wire, which a
/// `Response` returned to `service_fn` can never guarantee (hyper always
/// serializes and sends whatever is returned). Instead this notifies
/// `closer` and never resolves; the connection-driving loop races the
/// whole connection future against `closer.notified()` and drops the
/// connection (closing the socket) the moment it fires, which cancels this
/// still-pending future along with it before hyper writes anything.
async fn serve_one(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    is_ssl: bool,
    closer: Arc<Notify>,
) -> Response<BoxBody> {
    if req.method() == Method::CONNECT {
        return handle_connect(state, req, peer_addr).await;
    }

    match coordinator::handle_request(state, req, peer_addr.ip(), is_ssl).await {
        Outcome::Respond(resp) => resp,
        Outcome::CloseSilently => {
            closer.notify_one();
            std::future::pending().await
        }
    }
}

/// Route a CONNECT: for interception, the leaf cert is issued (and for
/// relay, the target is dialed) *before* the `200 Connection Established`
/// is written, so a failure there can still be reported as a single error
/// status rather than a response that promises a tunnel it can't deliver.
async fn handle_connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Response<BoxBody> {
    if state.config.no_proxy {
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(empty_body())
            .unwrap();
    }

    let target = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
    let hostname = target.split(':').next().unwrap_or(&target).to_string();
    let target_with_port = resolve_connect_target_port(&target);

    let certkey_path = std::path::PathBuf::from(&state.config.certkey);
    let timeout = state.config.timeout();
    let no_keep_alive = proxy_connection_requests_close(&req);

    if state.config.ssl_intercept {
        let acceptor = match crate::tls::connect::prepare_acceptor(&hostname, &state.cert_issuer, &certkey_path).await {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, hostname, "tls interception setup failed");
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header(http::header::CONNECTION, "close")
                    .body(empty_body())
                    .unwrap();
            }
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(e) => {
                    error!("server: connect: upgrade failed, error={}", e);
                    return;
                }
            };

            match crate::tls::connect::accept(upgraded, acceptor).await {
                Ok(tls_stream) => {
                    let io = TokioIo::new(tls_stream);
                    let state_inner = state.clone();
                    let closer = Arc::new(Notify::new());
                    let svc = service_fn({
                        let state_inner = state_inner.clone();
                        let closer = closer.clone();
                        move |req: Request<Incoming>| {
                            let state = state_inner.clone();
                            let closer = closer.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(
                                    serve_one(state, req, peer_addr, true, closer).await,
                                )
                            }
                        }
                    });
                    let conn = auto::Builder::new(TokioExecutor::new())
                        .http1()
                        .keep_alive(!no_keep_alive)
                        .http2()
                        .serve_connection_with_upgrades(io, svc);

                    tokio::select! {
                        result = conn => {
                            if let Err(e) = result {
                                if !e.to_string().contains("connection closed") {
                                    error!("server: connect: intercepted connection error, error={}", e);
                                }
                            }
                        }
                        _ = closer.notified() => {
                            tracing::debug!(peer = %peer_addr, "server: connect: dropping intercepted connection silently");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, hostname, "tls handshake failed after CONNECT was accepted");
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap()
    } else {
        let outbound = match crate::tls::connect::dial(&target_with_port, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, target = target_with_port, "connect relay dial failed");
                return Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(http::header::CONNECTION, "close")
                    .body(empty_body())
                    .unwrap();
            }
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(e) => {
                    error!("server: connect: upgrade failed, error={}", e);
                    return;
                }
            };
            match tokio::time::timeout(timeout, crate::tls::connect::splice(upgraded, outbound)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, target = target_with_port, "connect relay failed"),
                Err(_) => {
                    tracing::warn!(target = target_with_port, "connect relay timed out, closing");
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap()
    }
}

/// Run a simple admin server for health/readiness checks and metrics.
pub async fn run_admin_server(listen: &str, state: Arc<ProxyState>) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_connect_target_port_defaults_missing_port_to_443() {
        assert_eq!(resolve_connect_target_port("example.com"), "example.com:443");
    }

    #[test]
    fn resolve_connect_target_port_defaults_zero_port_to_443() {
        assert_eq!(resolve_connect_target_port("example.com:0"), "example.com:443");
    }

    #[test]
    fn resolve_connect_target_port_keeps_explicit_nonzero_port() {
        assert_eq!(resolve_connect_target_port("example.com:8443"), "example.com:8443");
    }
}
