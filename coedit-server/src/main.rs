use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coedit_server::{ServerConfig, ServerState, server};
use tokio::net::TcpListener;
use tokio::time;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Absolute ceiling on graceful shutdown before the process force-exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser)]
struct Args {
    /// Path of the persisted document.
    #[clap(long, default_value = "doc.txt")]
    doc: PathBuf,
    /// Listening TCP port, overriding the PORT environment variable.
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::from_env().expect("Parsing configuration");
    config.doc_path = args.doc;
    if let Some(port) = args.port {
        config.port = port;
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let state = Arc::new(ServerState::new(config).await.expect("Init server state"));

    info!("Starting server on http://{}", addr);
    let listener = TcpListener::bind(addr).await.expect("Unable to bind to host");

    let closing = state.closing();
    let serving = tokio::spawn(
        axum::serve(
            listener,
            server(Arc::clone(&state)).layer(TraceLayer::new_for_http()),
        )
        .with_graceful_shutdown(closing.cancelled_owned())
        .into_future(),
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    let graceful = time::timeout(SHUTDOWN_DEADLINE, async {
        state.shutdown("The server is shutting down.").await;
        serving.await
    })
    .await;

    let code = match graceful {
        Ok(Ok(Ok(()))) => {
            info!("Server has shut down");
            0
        }
        Ok(Ok(Err(e))) => {
            error!("closing the listener failed: {}", e);
            1
        }
        Ok(Err(e)) => {
            error!("serve task failed: {}", e);
            1
        }
        Err(_) => {
            error!(
                "graceful shutdown exceeded {:?}, exiting now",
                SHUTDOWN_DEADLINE
            );
            1
        }
    };
    std::process::exit(code);
}

/// Resolves on SIGINT, SIGTERM, or SIGUSR2.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("Install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("Install SIGTERM handler");
    let mut user2 = signal(SignalKind::user_defined2()).expect("Install SIGUSR2 handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = user2.recv() => {}
    }
}
