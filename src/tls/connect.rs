use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsStream};

use crate::error::ProxyError;
use crate::tls::issuer::CertIssuer;

/// Build a single-host `ServerConfig` from a freshly issued leaf cert and
/// the shared leaf private key. A fresh config is built per hostname
/// rather than cached, since issuance itself is already deduplicated by
/// `CertIssuer` and configs are cheap relative to a TLS handshake.
fn build_server_config(certpath: &Path, keypath: &Path) -> Result<Arc<ServerConfig>, ProxyError> {
    let cert_file = std::fs::File::open(certpath)
        .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

    let key_file =
        std::fs::File::open(keypath).map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?
        .ok_or_else(|| ProxyError::InterceptSetupFailed("no private key found in certkey file".to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Issue the leaf cert for `hostname` and build the single-host TLS
/// acceptor for it. Split out from `accept` so the CONNECT handler can
/// resolve issuance failures (500) *before* committing to a `200
/// Connection Established` response — once that response is written the
/// handshake step can only log and close, not change the status line.
pub async fn prepare_acceptor(
    hostname: &str,
    issuer: &CertIssuer,
    certkey_path: &Path,
) -> Result<TlsAcceptor, ProxyError> {
    let certpath = issuer.ensure_leaf(hostname).await?;
    let config = build_server_config(&certpath, certkey_path)?;
    Ok(TlsAcceptor::from(config))
}

/// Terminate client TLS on an upgraded CONNECT stream with a previously
/// prepared acceptor.
pub async fn accept(
    upgraded: Upgraded,
    acceptor: TlsAcceptor,
) -> Result<TlsStream<TokioIo<Upgraded>>, ProxyError> {
    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

    metrics::counter!("proxy_connect_total", "outcome" => "intercepted").increment(1);
    Ok(TlsStream::Server(tls_stream))
}

/// Dial the CONNECT target. Split out from `splice` so the handler can
/// report a fatal dial error as 502 before responding, rather than after.
pub async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))
}

/// Blind bidirectional relay between the client and an already-dialed
/// CONNECT target, used when TLS interception is disabled.
pub async fn splice(upgraded: Upgraded, mut outbound: TcpStream) -> Result<(), ProxyError> {
    let mut client = TokioIo::new(upgraded);

    metrics::counter!("proxy_connect_total", "outcome" => "relayed").increment(1);
    copy_bidirectional(&mut client, &mut outbound)
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_server_config_reports_missing_cert_file() {
        let err = build_server_config(Path::new("/nonexistent.crt"), Path::new("/nonexistent.key"));
        assert!(err.is_err());
    }
}
