use std::sync::Arc;

use soundtime_ext_sandbox::{serve, LogLevelControl, RuntimeConfig, WasmContext};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let (filter, reload_handle) = reload::Layer::new(filter);

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let levels = LogLevelControl::default().with_reload(move |level| {
        reload_handle
            .reload(EnvFilter::default().add_directive(level.into()))
            .map_err(|e| e.to_string())
    });

    let config = RuntimeConfig::from_env();
    tracing::info!(
        search_paths = ?config.search_paths,
        wasi_enabled = config.limits.wasi_enabled,
        "starting extension sandbox"
    );
    let context = Arc::new(WasmContext::new(config.limits.clone()));

    serve(tokio::io::stdin(), tokio::io::stdout(), config, context, levels).await;
}
