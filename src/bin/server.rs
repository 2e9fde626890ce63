//! promptplot server binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use promptplot::web::{router, AppState};
use promptplot::{AppConfig, CodeRunner};

#[tokio::main]
async fn main() -> Result<()> {
    // .env overlay first so the config sees OPENAI_API_KEY and friends.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    info!(
        csv = %config.csv_path.display(),
        model = %config.model,
        "starting promptplot v{}",
        env!("CARGO_PKG_VERSION")
    );

    if config.api_key.is_none() {
        // Deferred credential loading: the form still renders, the prompt
        // page reports the missing key per request.
        warn!("OPENAI_API_KEY is not set; prompts will fail until it is configured");
    }
    if !config.csv_path.exists() {
        warn!(csv = %config.csv_path.display(), "dataset CSV not found");
    }
    if let Some(static_dir) = config.graphic_path.parent() {
        std::fs::create_dir_all(static_dir)
            .with_context(|| format!("creating static dir {}", static_dir.display()))?;
    }

    let runner = CodeRunner::from_config(&config).context("locating a Python interpreter")?;
    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState::new(config, runner));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!("listening on http://{listen_addr}");

    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    Ok(())
}
