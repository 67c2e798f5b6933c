//! SecureVault HTTP server binary: loads `.env`, constructs the shared
//! [`AppState`], binds the axum router, and maintains the `server.pid`
//! lifecycle file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use securevault_lib::app_state::AppState;
use securevault_lib::{config, http, logging};

#[derive(Parser, Debug)]
#[command(name = "securevault-server")]
#[command(about = "SecureVault authentication and secret-vault server", long_about = None)]
struct Args {
    /// Path to the `.env` file to load at startup.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Data directory holding users.json, tokens.json, failed_attempts.json.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override SERVER_HOST from `.env`.
    #[arg(long)]
    host: Option<String>,

    /// Override SERVER_PORT from `.env`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (secrets, mut settings) = config::load(args.env_file, args.data_dir)?;
    if let Some(host) = args.host {
        settings.server_host = host;
    }
    if let Some(port) = args.port {
        settings.server_port = port;
    }

    let _log_guard = logging::init(&settings.data_dir.join("..").join("logs"))?;

    let pid_path = config::pid_file_path(&settings.data_dir);
    std::fs::write(&pid_path, format!("{}", std::process::id()))?;

    tracing::info!(
        target: "securevault::server",
        host = %settings.server_host,
        port = settings.server_port,
        "starting securevault server"
    );

    let addr: SocketAddr = format!("{}:{}", settings.server_host, settings.server_port).parse()?;
    let state = Arc::new(AppState::new(secrets, settings));
    let app = http::router(state).into_make_service_with_connect_info::<SocketAddr>();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = std::fs::remove_file(&pid_path);
    serve_result?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: "securevault::server", "received shutdown signal");
}
