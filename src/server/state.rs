use std::net::IpAddr;
use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::plugin::ProxyPlugin;
use crate::tls::CertIssuer;

/// Shared proxy state, cheaply cloneable via the `Arc` it is always held
/// behind: one fixed configuration for the life of the process, one
/// plugin chain, one fetch client, one certificate issuer.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub metrics: Metrics,
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
    pub cert_issuer: CertIssuer,
    pub fetch_client: reqwest::Client,
    /// Addresses this process is itself listening on, used by the loop
    /// detector to recognize a request that would proxy back to us.
    pub local_addresses: Vec<IpAddr>,
}

impl ProxyState {
    pub fn new(
        config: ProxyConfig,
        plugins: Vec<Arc<dyn ProxyPlugin>>,
        local_addresses: Vec<IpAddr>,
    ) -> Self {
        let cert_issuer = CertIssuer::new(
            config.certdir.clone(),
            config.certkey.clone(),
            config.cacert.clone(),
            config.cakey.clone(),
        );
        let fetch_client = crate::fetch::build_fetch_client(config.timeout());
        let metrics = Metrics::install();

        crate::plugin::announce_plugins(&plugins);

        Self {
            config,
            metrics,
            plugins,
            cert_issuer,
            fetch_client,
            local_addresses,
        }
    }

    /// Resolve a `host[:port]` origin to an IP address for loop detection.
    /// Best-effort: a resolution failure means "can't prove a loop", which
    /// effectively disables the loop check when DNS lookup fails.
    pub async fn resolve_origin_ip(&self, origin: &str) -> Option<IpAddr> {
        let lookup_target = if origin.contains(':') {
            origin.to_string()
        } else {
            format!("{origin}:0")
        };

        tokio::net::lookup_host(lookup_target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
    }
}
