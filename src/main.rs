mod app;
mod config;
mod connection;
mod edge;
mod metrics;
mod retry;
mod signal;
mod supervisor;

use clap::Parser;

/// Default config file name, overridable via VIADUCT_CONFIG.
const DEFAULT_CONFIG: &str = "viaduct.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // Load config file as env-var defaults (before clap parsing), keeping
    // the precedence CLI > env > config file.
    let config_path =
        std::env::var("VIADUCT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let path = std::path::Path::new(&config_path);
    if path.exists() {
        match config::ConfigFile::load(path) {
            Ok(file_config) => file_config.inject_env(),
            Err(e) => eprintln!("warning: failed to load {}: {}", config_path, e),
        }
    }

    let config = config::Config::parse();
    app::run(config).await
}
