use crate::config::{self, ProxyConfig};
use crate::plugin::ProxyPlugin;
use crate::server::{self, ProxyState};
use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Proxy lifecycle: init → load config → bind listeners → serve → shutdown.
pub async fn run(args: BootstrapArgs, plugins: Vec<Arc<dyn ProxyPlugin>>) -> Result<()> {
    let mut cfg = config::ProxyConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        cfg.bind = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        cfg.admin_bind = admin_listen;
    }

    init_tracing(&cfg);

    let local_addresses = local_bind_addresses(&cfg);
    let state = Arc::new(ProxyState::new(cfg, plugins, local_addresses));

    let shutdown = Arc::new(Notify::new());

    start_admin_server(&state, &shutdown);

    tracing::info!("server: starting proxy, listen={}", state.config.bind);

    let proxy_handle = tokio::spawn({
        let listen = state.config.bind.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// Build the `EnvFilter` level from the config's verbosity flags: `trace`
/// implies `debug` implies `verbose` implies the default `info`. An
/// explicit `RUST_LOG` env var always wins, matching the original's
/// options-vs-environment precedence for every other setting.
fn tracing_level(cfg: &ProxyConfig) -> &'static str {
    if cfg.trace {
        "trace"
    } else if cfg.debug {
        "debug"
    } else if cfg.verbose {
        "info"
    } else {
        "warn"
    }
}

/// Configure `tracing-subscriber`: JSON logs to stdout always, plus a tee
/// to `cfg.log` when both `log` and `tee` are set — the rendering of the
/// original's `ProxyLogger` file-tee option.
fn init_tracing(cfg: &ProxyConfig) {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());
    std::mem::forget(stdout_guard);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing_level(cfg)));

    let file_layer = if cfg.tee {
        cfg.log.as_ref().and_then(|path| match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => {
                let (file_writer, file_guard) = tracing_appender::non_blocking(file);
                std::mem::forget(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false)
                        .with_target(false)
                        .json(),
                )
            }
            Err(e) => {
                eprintln!("server: could not open tee log file {path}: {e}");
                None
            }
        })
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(stdout_writer)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .with(file_layer)
        .init();
}

/// Addresses this process is itself listening on, for loop detection. Best
/// effort: parses the bind address directly; "0.0.0.0"/"::" are expanded
/// to loopback plus any local interface addresses would require a
/// platform-specific lookup this proxy doesn't otherwise need, so those
/// wildcard cases fall back to loopback only.
fn local_bind_addresses(cfg: &ProxyConfig) -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::from([127, 0, 0, 1]), IpAddr::from([0, 0, 0, 0])];
    if let Ok(socket_addr) = cfg.bind.parse::<std::net::SocketAddr>() {
        addrs.push(socket_addr.ip());
    }
    addrs
}

fn start_admin_server(state: &Arc<ProxyState>, shutdown: &Arc<Notify>) {
    let s = state.clone();
    let admin_addr = state.config.admin_bind.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = server::run_admin_server(&admin_addr, s) => {
                if let Err(e) = result {
                    tracing::error!("server: admin failed, error={}", e);
                }
            }
            _ = shutdown.notified() => {}
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_level_prefers_trace_over_debug_over_verbose() {
        let mut cfg = ProxyConfig::default();
        assert_eq!(tracing_level(&cfg), "warn");
        cfg.verbose = true;
        assert_eq!(tracing_level(&cfg), "info");
        cfg.debug = true;
        assert_eq!(tracing_level(&cfg), "debug");
        cfg.trace = true;
        assert_eq!(tracing_level(&cfg), "trace");
    }

    #[test]
    fn local_bind_addresses_includes_parsed_bind_addr() {
        let mut cfg = ProxyConfig::default();
        cfg.bind = "10.0.0.5:8080".to_string();
        let addrs = local_bind_addresses(&cfg);
        assert!(addrs.contains(&IpAddr::from([10, 0, 0, 5])));
        assert!(addrs.contains(&IpAddr::from([127, 0, 0, 1])));
    }
}
