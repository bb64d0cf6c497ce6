pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod loop_detect;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod server;
pub mod tls;
