use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::ProxyError;

/// Issues per-hostname leaf certificates by shelling out to `openssl`: a
/// `openssl req` piped into `openssl x509 -req`, signed by a configured CA
/// key, with the serial number set to the current epoch millisecond.
///
/// A leaf is considered valid indefinitely once issued — re-issuing on
/// every restart is not attempted, a file on disk is treated as proof of
/// validity. Concurrent first-issue attempts for the *same* hostname are
/// serialized through a per-hostname lock purely to avoid redundant
/// subprocess spawns; across process restarts a last-writer-wins race is
/// tolerated.
pub struct CertIssuer {
    certdir: PathBuf,
    certkey: PathBuf,
    cacert: PathBuf,
    cakey: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertIssuer {
    pub fn new(certdir: impl Into<PathBuf>, certkey: impl Into<PathBuf>, cacert: impl Into<PathBuf>, cakey: impl Into<PathBuf>) -> Self {
        Self {
            certdir: certdir.into(),
            certkey: certkey.into(),
            cacert: cacert.into(),
            cakey: cakey.into(),
            locks: DashMap::new(),
        }
    }

    fn cert_path(&self, hostname: &str) -> PathBuf {
        self.certdir.join(format!("{hostname}.crt"))
    }

    /// A cert file counts as already issued only if it's non-empty — an
    /// empty file (e.g. left behind by a prior truncated write) is treated
    /// as missing and regenerated.
    fn cert_is_valid(certpath: &Path) -> bool {
        std::fs::metadata(certpath)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    fn hostname_lock(&self, hostname: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensure a leaf certificate exists for `hostname`, generating one on
    /// first use. Returns the path to the signed certificate.
    pub async fn ensure_leaf(&self, hostname: &str) -> Result<PathBuf, ProxyError> {
        let certpath = self.cert_path(hostname);
        if Self::cert_is_valid(&certpath) {
            metrics::counter!("proxy_cert_issued_total", "outcome" => "cache_hit").increment(1);
            return Ok(certpath);
        }

        let lock = self.hostname_lock(hostname);
        let _guard = lock.lock().await;

        // Another task may have generated it while we waited for the lock.
        if Self::cert_is_valid(&certpath) {
            metrics::counter!("proxy_cert_issued_total", "outcome" => "cache_hit").increment(1);
            return Ok(certpath);
        }

        tracing::debug!(hostname, "generating leaf certificate");
        self.generate(hostname, &certpath).await?;

        if !Self::cert_is_valid(&certpath) {
            metrics::counter!("proxy_cert_issue_failures_total").increment(1);
            return Err(ProxyError::InterceptSetupFailed(format!(
                "openssl did not produce a certificate at {}",
                certpath.display()
            )));
        }

        metrics::counter!("proxy_cert_issued_total", "outcome" => "generated").increment(1);
        Ok(certpath)
    }

    async fn generate(&self, hostname: &str, certpath: &Path) -> Result<(), ProxyError> {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        // Older openssl builds on Windows default RANDFILE to a path under
        // %HOME% that may not exist; pointing it at certdir avoids that.
        // Harmless on other platforms.
        let randfile = self.certdir.join(".rnd");

        let req_output = Command::new("openssl")
            .args([
                "req",
                "-new",
                "-key",
                &self.certkey.to_string_lossy(),
                "-subj",
                &format!("/CN={hostname}"),
            ])
            .env("RANDFILE", &randfile)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "openssl not found on PATH; cannot serve intercepted HTTPS traffic");
                ProxyError::InterceptSetupFailed("openssl binary not found".to_string())
            })?;

        if !req_output.status.success() {
            let stderr = String::from_utf8_lossy(&req_output.stderr);
            return Err(ProxyError::InterceptSetupFailed(format!(
                "openssl req failed: {stderr}"
            )));
        }

        let mut sign = Command::new("openssl")
            .args([
                "x509",
                "-req",
                "-days",
                "3650",
                "-CA",
                &self.cacert.to_string_lossy(),
                "-CAkey",
                &self.cakey.to_string_lossy(),
                "-set_serial",
                &epoch_ms,
                "-out",
                &certpath.to_string_lossy(),
            ])
            .env("RANDFILE", &randfile)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

        sign.stdin
            .take()
            .expect("piped stdin")
            .write_all(&req_output.stdout)
            .await
            .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

        let sign_output = sign
            .wait_with_output()
            .await
            .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))?;

        if !sign_output.status.success() {
            let stderr = String::from_utf8_lossy(&sign_output.stderr);
            return Err(ProxyError::InterceptSetupFailed(format!(
                "openssl x509 crt request failed: {stderr}"
            )));
        }

        Ok(())
    }

    /// Write the root CA certificate bytes, for serving at `proxy_self_url`.
    pub async fn read_ca_cert(&self) -> Result<Vec<u8>, ProxyError> {
        tokio::fs::read(&self.cacert)
            .await
            .map_err(|e| ProxyError::InterceptSetupFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_path_is_certdir_joined_with_hostname() {
        let issuer = CertIssuer::new("/tmp/certs", "/tmp/leaf.key", "/tmp/ca.crt", "/tmp/ca.key");
        assert_eq!(
            issuer.cert_path("example.com"),
            PathBuf::from("/tmp/certs/example.com.crt")
        );
    }

    #[test]
    fn cert_is_valid_rejects_missing_and_empty_files() {
        let dir = std::env::temp_dir().join(format!("proxy2-rs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let missing = dir.join("missing.crt");
        assert!(!CertIssuer::cert_is_valid(&missing));

        let empty = dir.join("empty.crt");
        std::fs::write(&empty, b"").unwrap();
        assert!(!CertIssuer::cert_is_valid(&empty));

        let nonempty = dir.join("nonempty.crt");
        std::fs::write(&nonempty, b"-----BEGIN CERTIFICATE-----").unwrap();
        assert!(CertIssuer::cert_is_valid(&nonempty));

        std::fs::remove_dir_all(&dir).ok();
    }
}
