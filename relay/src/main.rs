//! MCP relay server.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, fmt::time::UtcTime, layer::SubscriberExt, util::SubscriberInitExt};
use tracing_subscriber::EnvFilter;

use mcp_relay::{
    config::Config, create_app_with_state, janitor::Janitor, session::CloseReason,
    state::AppState,
};

/// MCP relay - bridges streaming MCP clients to request/response HTTP backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "MCP_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Evict sessions idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_figment(
        args.config,
        args.port,
        args.idle_timeout_secs,
        args.log_level,
    )?;

    // Must stay alive for the file writer to flush
    let _log_guard = init_logging(&config)?;
    info!("Configuration loaded");

    let state = AppState::from_config(config.clone())?;
    let janitor = Janitor::start(
        state.registry().clone(),
        config.idle_timeout,
        config.janitor_interval,
    );

    let app = create_app_with_state(state.clone());

    // Bind to 0.0.0.0 to be accessible from all interfaces (Docker, network, etc.)
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let registry = state.registry().clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }

        info!("Received Ctrl+C, shutting down gracefully...");

        // Open streams keep the server busy until their sessions are released
        let closed = registry.close_all(CloseReason::Shutdown).await;
        info!("Closed {} session(s)", closed);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    janitor.stop().await;
    info!("Relay stopped");

    Ok(())
}

/// Initialize logging to stdout, and to a file when configured.
///
/// Level priority: config/CLI > RUST_LOG > info.
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let timer = UtcTime::new(time::format_description::well_known::Rfc3339);
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_timer(timer.clone())
        .compact();

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory)?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(path) = &config.log_file {
        info!("Logging to file: {}", path.display());
    }

    Ok(guard)
}
