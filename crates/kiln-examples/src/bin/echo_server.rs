//! 长度前缀回显服务。
//!
//! # 使用方法
//! ```bash
//! cargo run -p kiln-examples --bin echo_server -- crates/kiln-examples/config/echo.toml
//! ```
//! - 省略配置路径时监听 `127.0.0.1:7878`，使用 4 个工作线程；
//! - 环境变量 `RUST_LOG` 优先于配置中的 `log_filter`；
//! - Ctrl-C 触发有序停机。

use std::{env, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use kiln_examples::EchoHandler;
use kiln_transport_tcp::{ConnectionHandler, ConnectionInfo, ConnectionManager, NetworkConfig};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EchoConfig {
    #[serde(default = "default_log_filter")]
    log_filter: String,
    network: NetworkConfig,
}

fn default_log_filter() -> String {
    "info".to_owned()
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            network: NetworkConfig::new("127.0.0.1", 7878, 4),
        }
    }
}

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    args.retain(|arg| arg.trim_start_matches('-') != "quick");
    let config = match args.first() {
        Some(path) => load_config(PathBuf::from(path))?,
        None => EchoConfig::default(),
    };
    install_tracing(&config.log_filter)?;

    let manager = ConnectionManager::new();
    manager
        .start_with_config(
            &config.network,
            Arc::new(|_: &ConnectionInfo| {
                Box::new(EchoHandler::default()) as Box<dyn ConnectionHandler>
            }),
        )
        .context("failed to start network")?;
    tracing::info!(
        addr = %manager.local_addr()?,
        threads = manager.thread_count(),
        "echo server listening"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to wait for ctrl-c")?;

    tracing::info!(counts = ?manager.connection_counts(), "shutting down");
    manager.stop();
    Ok(())
}

fn load_config(path: PathBuf) -> Result<EchoConfig> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config `{}`", path.display()))?;
    let config: EchoConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse config `{}`", path.display()))?;
    config.network.validate()?;
    Ok(config)
}

fn install_tracing(fallback: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback)
            .with_context(|| format!("invalid log filter `{fallback}`"))?,
    };
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    Ok(())
}
