//! wgdockd - Docker network driver daemon for WireGuard networks.
//!
//! Serves the libnetwork remote-driver protocol over a unix socket and
//! tears down all managed networks on shutdown.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wgdock_net::Driver;

mod api;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unix socket the Docker daemon discovers the plugin through
    #[arg(long, default_value_os_t = wgdock_common::paths::PLUGIN_SOCKET.clone())]
    socket_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let driver = match Driver::new() {
        Ok(driver) => Arc::new(Mutex::new(driver)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize driver");
            return ExitCode::from(1);
        }
    };

    let listener = match bind_socket(&args.socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(
                error = %e,
                path = %args.socket_path.display(),
                "Failed to bind plugin socket"
            );
            return ExitCode::from(2);
        }
    };
    tracing::info!(path = %args.socket_path.display(), "wgdockd listening");

    let app = api::server::app(Arc::clone(&driver));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let mut code = ExitCode::SUCCESS;
    if let Err(e) = served {
        tracing::error!(error = %e, "Plugin transport failed");
        code = ExitCode::from(2);
    }

    tracing::info!("Shutting down, deleting remaining networks");
    if let Err(e) = driver.lock().await.delete().await {
        tracing::error!(error = %e, "Shutdown cleanup failed");
    }
    let _ = std::fs::remove_file(&args.socket_path);

    code
}

fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A socket left behind by a previous run would make bind fail.
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
}
