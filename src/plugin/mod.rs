use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use crate::error::ProxyError;
use crate::proxy::context::ProxyTransaction;

/// Outcome of running a plugin hook: either the transaction proceeds
/// normally, or the plugin demands a control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginSignal {
    /// Continue to the next plugin / phase as normal.
    Continue,
    /// Abort the transaction and close the client connection without
    /// writing any response.
    DropConnection,
    /// Skip the origin fetch entirely; a plugin will have already placed
    /// whatever response body it wants forwarded.
    DontFetchResponse,
}

/// A request flowing through the request-phase plugin chain. Plugins may
/// rewrite the path, headers, or body, or redirect the request to a
/// different origin by changing `outbound_origin`.
pub struct PluginRequest<'a> {
    pub tx: &'a mut ProxyTransaction,
    pub body: Bytes,
}

/// A response flowing through the response-phase plugin chain. `body` is
/// always the decoded (identity) representation; the coordinator
/// re-encodes after the chain runs.
pub struct PluginResponse<'a> {
    pub tx: &'a ProxyTransaction,
    pub status: u16,
    pub headers: &'a mut HeaderMap,
    pub body: Bytes,
}

/// A plugin hooking into the request and/or response phase of a
/// transaction. Default method bodies are no-ops, so a plugin implementing
/// only one phase needs zero boilerplate for the other.
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Stable name used in logs and the `help()` self-description line.
    fn name(&self) -> &str;

    /// One-line description logged once at startup, analogous to
    /// `plugin.help(None)` being called for every loaded plugin.
    fn help(&self) -> Option<&str> {
        None
    }

    async fn request_handler(
        &self,
        _req: &mut PluginRequest<'_>,
    ) -> Result<PluginSignal, ProxyError> {
        Ok(PluginSignal::Continue)
    }

    async fn response_handler(
        &self,
        _resp: &mut PluginResponse<'_>,
    ) -> Result<PluginSignal, ProxyError> {
        Ok(PluginSignal::Continue)
    }
}

/// Result of running the full request-phase chain.
pub struct RequestChainOutcome {
    pub signal: PluginSignal,
    pub body: Bytes,
    pub altered: bool,
}

/// Run every plugin's `request_handler` in order. A header/body snapshot
/// diff tracks whether anything changed, and a `DropConnection`/
/// `DontFetchResponse` signal from any plugin short-circuits the rest of
/// the chain immediately.
///
/// A plugin error is logged and swallowed (the chain continues to the
/// next plugin) unless `debug` is set, in which case it aborts the whole
/// transaction — mirroring spec.md's "logged and swallowed unless debug
/// is enabled (then re-raised)" policy for the request phase, and the
/// unified version of it §9 recommends for the response phase too.
pub async fn dispatch_request_chain(
    plugins: &[std::sync::Arc<dyn ProxyPlugin>],
    tx: &mut ProxyTransaction,
    body: Bytes,
    debug: bool,
) -> Result<RequestChainOutcome, ProxyError> {
    let mut current = body.clone();
    let mut altered = false;

    for plugin in plugins {
        let before_headers = tx.headers.clone();
        let mut req = PluginRequest {
            tx,
            body: current.clone(),
        };

        match plugin.request_handler(&mut req).await {
            Ok(PluginSignal::Continue) => {
                let next = req.body;
                if next != current {
                    altered = true;
                    current = next;
                }
                if before_headers != tx.headers {
                    altered = true;
                }
            }
            Ok(signal) => {
                tracing::debug!(plugin = plugin.name(), ?signal, "plugin issued control signal");
                return Ok(RequestChainOutcome {
                    signal,
                    body: current,
                    altered,
                });
            }
            Err(e) => {
                metrics::counter!("proxy_plugin_errors_total", "plugin" => plugin.name().to_string())
                    .increment(1);
                tracing::warn!(plugin = plugin.name(), error = %e, "plugin request_handler failed");
                if debug {
                    return Err(e);
                }
            }
        }
    }

    Ok(RequestChainOutcome {
        signal: PluginSignal::Continue,
        body: current,
        altered,
    })
}

/// Result of running the full response-phase chain.
pub struct ResponseChainOutcome {
    pub body: Bytes,
    pub altered: bool,
}

/// Run every plugin's `response_handler` in order, tracking whether any
/// plugin altered the headers or body along the way.
/// Unlike the request phase, a `DropConnection` signal here still means
/// "stop calling further plugins" but the coordinator has already
/// committed to writing a response, so it is treated as a no-op stop.
///
/// Follows the same debug-gated error policy as [`dispatch_request_chain`]:
/// logged and swallowed unless `debug` is set, in which case the error
/// aborts the transaction. spec.md §9 flags the original's two phases as
/// inconsistent here and recommends unifying on this rule.
pub async fn dispatch_response_chain(
    plugins: &[std::sync::Arc<dyn ProxyPlugin>],
    tx: &ProxyTransaction,
    status: u16,
    headers: &mut HeaderMap,
    body: Bytes,
    debug: bool,
) -> Result<ResponseChainOutcome, ProxyError> {
    let mut current = body.clone();
    let mut altered = false;

    for plugin in plugins {
        let before_headers = headers.clone();
        let mut resp = PluginResponse {
            tx,
            status,
            headers,
            body: current.clone(),
        };

        match plugin.response_handler(&mut resp).await {
            Ok(signal) => {
                let next = resp.body;
                if next != current {
                    altered = true;
                    current = next;
                }
                if &before_headers != headers {
                    altered = true;
                }
                if signal != PluginSignal::Continue {
                    tracing::debug!(plugin = plugin.name(), ?signal, "plugin issued control signal in response phase");
                    break;
                }
            }
            Err(e) => {
                metrics::counter!("proxy_plugin_errors_total", "plugin" => plugin.name().to_string())
                    .increment(1);
                tracing::warn!(plugin = plugin.name(), error = %e, "plugin response_handler failed");
                if debug {
                    return Err(e);
                }
            }
        }
    }

    if altered {
        tracing::debug!("plugin chain altered the response");
    }

    Ok(ResponseChainOutcome {
        body: current,
        altered,
    })
}

/// Log each plugin's `help()` line once at startup.
pub fn announce_plugins(plugins: &[std::sync::Arc<dyn ProxyPlugin>]) {
    for plugin in plugins {
        match plugin.help() {
            Some(desc) => tracing::info!(plugin = plugin.name(), "{}", desc),
            None => tracing::debug!(plugin = plugin.name(), "loaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    struct HeaderTaggingPlugin;

    #[async_trait]
    impl ProxyPlugin for HeaderTaggingPlugin {
        fn name(&self) -> &str {
            "header_tagging"
        }

        async fn request_handler(
            &self,
            req: &mut PluginRequest<'_>,
        ) -> Result<PluginSignal, ProxyError> {
            req.tx.headers.insert(
                "x-plugin-tagged",
                http::HeaderValue::from_static("1"),
            );
            Ok(PluginSignal::Continue)
        }
    }

    struct DropEverythingPlugin;

    #[async_trait]
    impl ProxyPlugin for DropEverythingPlugin {
        fn name(&self) -> &str {
            "drop_everything"
        }

        async fn request_handler(
            &self,
            _req: &mut PluginRequest<'_>,
        ) -> Result<PluginSignal, ProxyError> {
            Ok(PluginSignal::DropConnection)
        }
    }

    struct RedirectPlugin;

    #[async_trait]
    impl ProxyPlugin for RedirectPlugin {
        fn name(&self) -> &str {
            "redirect"
        }

        async fn request_handler(
            &self,
            req: &mut PluginRequest<'_>,
        ) -> Result<PluginSignal, ProxyError> {
            // A plugin demands a redirect by rewriting the path to an
            // absolute-form URL; the coordinator's RESOLVE_TARGET step (not
            // exercised by this dispatcher-only test) is what turns that
            // into `outbound_origin`.
            req.tx.uri_path = "https://rewritten.example.com/path".to_string();
            Ok(PluginSignal::Continue)
        }
    }

    fn sample_tx() -> ProxyTransaction {
        ProxyTransaction::new(
            Method::GET,
            "/".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            "example.com".to_string(),
            "https",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    struct FailingPlugin;

    #[async_trait]
    impl ProxyPlugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }

        async fn request_handler(
            &self,
            _req: &mut PluginRequest<'_>,
        ) -> Result<PluginSignal, ProxyError> {
            Err(ProxyError::Internal("boom".to_string()))
        }

        async fn response_handler(
            &self,
            _resp: &mut PluginResponse<'_>,
        ) -> Result<PluginSignal, ProxyError> {
            Err(ProxyError::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn header_mutation_is_detected_as_altered() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> = vec![Arc::new(HeaderTaggingPlugin)];
        let mut tx = sample_tx();
        let outcome = dispatch_request_chain(&plugins, &mut tx, Bytes::new(), false)
            .await
            .unwrap();
        assert!(outcome.altered);
        assert_eq!(outcome.signal, PluginSignal::Continue);
        assert!(tx.headers.contains_key("x-plugin-tagged"));
    }

    #[tokio::test]
    async fn drop_connection_signal_short_circuits() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> =
            vec![Arc::new(DropEverythingPlugin), Arc::new(HeaderTaggingPlugin)];
        let mut tx = sample_tx();
        let outcome = dispatch_request_chain(&plugins, &mut tx, Bytes::new(), false)
            .await
            .unwrap();
        assert_eq!(outcome.signal, PluginSignal::DropConnection);
        assert!(!tx.headers.contains_key("x-plugin-tagged"));
    }

    #[tokio::test]
    async fn plugin_error_is_swallowed_when_not_debug() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> =
            vec![Arc::new(FailingPlugin), Arc::new(HeaderTaggingPlugin)];
        let mut tx = sample_tx();
        let outcome = dispatch_request_chain(&plugins, &mut tx, Bytes::new(), false)
            .await
            .unwrap();
        assert_eq!(outcome.signal, PluginSignal::Continue);
        assert!(tx.headers.contains_key("x-plugin-tagged"));
    }

    #[tokio::test]
    async fn plugin_error_aborts_transaction_when_debug() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> =
            vec![Arc::new(FailingPlugin), Arc::new(HeaderTaggingPlugin)];
        let mut tx = sample_tx();
        let result = dispatch_request_chain(&plugins, &mut tx, Bytes::new(), true).await;
        assert!(result.is_err());
        assert!(!tx.headers.contains_key("x-plugin-tagged"));
    }

    #[tokio::test]
    async fn redirect_plugin_rewrites_path_to_absolute_url() {
        let plugins: Vec<Arc<dyn ProxyPlugin>> = vec![Arc::new(RedirectPlugin)];
        let mut tx = sample_tx();
        dispatch_request_chain(&plugins, &mut tx, Bytes::new(), false)
            .await
            .unwrap();
        // The dispatcher only runs plugins; turning an absolute-form path
        // rewrite into `outbound_origin` is the coordinator's RESOLVE_TARGET
        // step (`proxy::coordinator::resolve_target`), tested there.
        assert_eq!(tx.uri_path, "https://rewritten.example.com/path");
    }
}
