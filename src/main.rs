#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use proxy2_rs::plugin::ProxyPlugin;
use proxy2_rs::server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "proxy2-rs", about = "Intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "proxy2.toml")]
    config: PathBuf,

    /// Listen address, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/metrics), overriding the config file
    #[arg(long)]
    admin_listen: Option<String>,
}

/// The plugin chain this binary runs. Plugins are constructed here rather
/// than loaded dynamically: `ProxyPlugin` is an in-process trait, not a
/// dynamic-loading facility.
fn build_plugins() -> Vec<Arc<dyn ProxyPlugin>> {
    Vec::new()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(
        server::bootstrap::BootstrapArgs {
            config_path: cli.config,
            listen: cli.listen,
            admin_listen: cli.admin_listen,
        },
        build_plugins(),
    ))
}
