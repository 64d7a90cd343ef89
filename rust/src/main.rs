use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use image_batch_studio::backend::HttpBackend;
use image_batch_studio::config_store::ConfigStore;
use image_batch_studio::logging;
use image_batch_studio::path_utils::{get_base_dir, resolve_config_path};
use image_batch_studio::server::{AppServer, AppState};

#[derive(Debug, Parser)]
#[command(name = "image_batch_studio", version, about = "Local web UI for batch image generation")]
struct Args {
    /// Config file; created with defaults when missing.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to try first, overriding `app.server_port`.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();
    logging::init()?;

    let config_path = resolve_config_path(args.config, &get_base_dir());
    let config = ConfigStore::new(config_path.clone())
        .with_context(|| format!("failed to load config: {}", config_path.display()))?;
    info!(path = %config_path.display(), "config loaded");

    let backend_config = config.http_backend_config();
    if backend_config.api_key.is_none() {
        warn!("no API key configured; requests are sent without authorization");
    }
    let backend = HttpBackend::new(backend_config);
    info!(endpoint = backend.endpoint(), "image backend ready");

    let preferred_port = args.port.unwrap_or_else(|| config.server_port());
    let state = Arc::new(AppState::new(config, Arc::new(backend)));
    let mut server = AppServer::start(state, preferred_port)?;
    info!(url = %server.url(), "open the page in a browser");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to wait for ctrl-c")?;

    info!(port = server.port(), "shutting down");
    server.stop();
    Ok(())
}
