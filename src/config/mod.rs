use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level proxy configuration: listen address, PKI paths, the
/// interception switch, and diagnostic verbosity.
///
/// Loaded from an optional TOML file, falling back to built-in defaults,
/// with CLI flags applied on top in `main.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy front-end listens on, e.g. "0.0.0.0:8080".
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Address the admin server (health/metrics) listens on.
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Socket timeout (seconds) applied to upstream fetches and CONNECT relay.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory holding issued per-host leaf certificates.
    #[serde(default = "default_certdir")]
    pub certdir: String,

    /// Private key shared by every issued leaf certificate.
    #[serde(default = "default_certkey")]
    pub certkey: String,

    /// Root CA certificate clients must trust.
    #[serde(default = "default_cacert")]
    pub cacert: String,

    /// Root CA private key used to sign leaves.
    #[serde(default = "default_cakey")]
    pub cakey: String,

    /// Request path that serves the CA certificate to clients, e.g. "/ca.crt".
    #[serde(default = "default_proxy_self_url")]
    pub proxy_self_url: String,

    /// Disable CONNECT handling entirely.
    #[serde(default)]
    pub no_proxy: bool,

    /// Terminate client TLS with dynamically issued leaves. When false,
    /// CONNECT falls back to a blind bidirectional relay.
    #[serde(default = "default_ssl_intercept")]
    pub ssl_intercept: bool,

    /// Skip the printable-ASCII validation of method/path/headers.
    #[serde(default)]
    pub allow_invalid: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub trace: bool,

    #[serde(default)]
    pub verbose: bool,

    /// Optional path to additionally tee log output to.
    #[serde(default)]
    pub log: Option<String>,

    #[serde(default)]
    pub tee: bool,

    /// Reserved metadata headers used as the plugin <-> coordinator control
    /// channel. Names are configurable but globally fixed for one run.
    #[serde(default)]
    pub metadata_headers: MetadataHeaderNames,
}

/// Names of the reserved metadata headers used as the in-band
/// plugin-to-coordinator control channel. Never forwarded to the client;
/// scanned out of both request and response header sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataHeaderNames {
    #[serde(default = "default_override_host")]
    pub override_host_header: String,

    #[serde(default = "default_override_encoding")]
    pub override_response_content_encoding: String,

    #[serde(default = "default_ignore_decompression_errors")]
    pub ignore_response_decompression_errors: String,
}

impl Default for MetadataHeaderNames {
    fn default() -> Self {
        Self {
            override_host_header: default_override_host(),
            override_response_content_encoding: default_override_encoding(),
            ignore_response_decompression_errors: default_ignore_decompression_errors(),
        }
    }
}

impl MetadataHeaderNames {
    /// All reserved names, lowercased, for the forwarding-exclusion scan.
    pub fn all_lower(&self) -> [String; 3] {
        [
            self.override_host_header.to_ascii_lowercase(),
            self.override_response_content_encoding.to_ascii_lowercase(),
            self.ignore_response_decompression_errors.to_ascii_lowercase(),
        ]
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_bind() -> String {
    "127.0.0.1:9091".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_certdir() -> String {
    "./certs".to_string()
}
fn default_certkey() -> String {
    "./ca/leaf.key".to_string()
}
fn default_cacert() -> String {
    "./ca/ca.crt".to_string()
}
fn default_cakey() -> String {
    "./ca/ca.key".to_string()
}
fn default_proxy_self_url() -> String {
    "/proxy2.ca.crt".to_string()
}
fn default_ssl_intercept() -> bool {
    true
}
fn default_override_host() -> String {
    "X-Proxy2-Override-Host".to_string()
}
fn default_override_encoding() -> String {
    "X-Proxy2-Override-Response-Encoding".to_string()
}
fn default_ignore_decompression_errors() -> String {
    "X-Proxy2-Ignore-Decompression-Errors".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_bind: default_admin_bind(),
            timeout_secs: default_timeout(),
            certdir: default_certdir(),
            certkey: default_certkey(),
            cacert: default_cacert(),
            cakey: default_cakey(),
            proxy_self_url: default_proxy_self_url(),
            no_proxy: false,
            ssl_intercept: default_ssl_intercept(),
            allow_invalid: false,
            debug: false,
            trace: false,
            verbose: false,
            log: None,
            tee: false,
            metadata_headers: MetadataHeaderNames::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file if it exists, otherwise start
    /// from built-in defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            // Runs before tracing is configured (the log level itself comes
            // from this config), so this falls back to eprintln like
            // server::runtime's CPU-limit detection does for the same reason.
            eprintln!(
                "[config] config file not found at {}, using defaults",
                path.display()
            );
            ProxyConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind.is_empty() {
            anyhow::bail!("bind address cannot be empty");
        }
        if self.ssl_intercept
            && (self.certkey.is_empty() || self.cacert.is_empty() || self.cakey.is_empty())
        {
            anyhow::bail!("certkey/cacert/cakey are required when ssl_intercept is enabled");
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ProxyConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn metadata_header_names_lowercase() {
        let names = MetadataHeaderNames::default();
        let all = names.all_lower();
        assert_eq!(all[0], "x-proxy2-override-host");
        assert_eq!(all[1], "x-proxy2-override-response-encoding");
        assert_eq!(all[2], "x-proxy2-ignore-decompression-errors");
    }

    #[test]
    fn loads_missing_file_as_defaults() {
        let cfg = ProxyConfig::load(Path::new("/nonexistent/proxy2.toml")).unwrap();
        assert_eq!(cfg.bind, default_bind());
    }
}
