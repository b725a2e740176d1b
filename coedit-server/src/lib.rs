//! Server backend for the Coedit collaborative rich-text editor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coedit::{Coedit, ServerMsg};
use crate::document::DocumentStore;
use crate::image::ImageLimits;

mod coedit;
pub mod document;
pub mod image;

/// Largest transport message the server accepts, in bytes.
const MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// Quiet window coalescing a burst of edits into one write.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Cadence of the stale-session sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening TCP port.
    pub port: u16,
    /// Path of the persisted document.
    pub doc_path: PathBuf,
    /// Period of the background save tick.
    pub save_interval: Duration,
    /// Hard cap on document size, in bytes.
    pub max_doc_bytes: usize,
    /// Hard cap on a decoded image payload, in bytes.
    pub max_image_bytes: usize,
    /// Bounding box edge for image rescaling, in pixels.
    pub image_max_dimension: u32,
    /// Quality for JPEG re-encoding, 1-100.
    pub image_jpeg_quality: u8,
    /// How long clients keep an idle peer caret visible. Relayed to the
    /// client shell, never enforced here.
    pub cursor_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            doc_path: "doc.txt".into(),
            save_interval: Duration::from_millis(15_000),
            max_doc_bytes: 50 * 1024 * 1024,
            max_image_bytes: 250 * 1024,
            image_max_dimension: 400,
            image_jpeg_quality: 40,
            cursor_timeout: Duration::from_millis(30_000),
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            port: env_or("PORT", defaults.port)?,
            doc_path: defaults.doc_path,
            save_interval: Duration::from_millis(env_or("SAVE_INTERVAL", 15_000)?),
            max_doc_bytes: env_or("MAX_DOC_MB", 50)? * 1024 * 1024,
            max_image_bytes: env_or("MAX_IMAGE_KB", 250)? * 1024,
            image_max_dimension: env_or("IMAGE_MAX_DIMENSION", defaults.image_max_dimension)?,
            image_jpeg_quality: env_or("IMAGE_JPEG_QUALITY", defaults.image_jpeg_quality)?,
            cursor_timeout: Duration::from_millis(env_or("CURSOR_TIMEOUT", 30_000)?),
        })
    }

    /// Configuration writing to a fresh temporary path, for tests.
    pub fn temporary() -> Self {
        let doc_path = std::env::temp_dir()
            .join(format!("coedit_{:x}", rand::random::<u64>()))
            .join("doc.txt");
        Self {
            doc_path,
            ..Self::default()
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Unable to parse {name}")),
        Err(_) => Ok(default),
    }
}

/// The shared state of the server, accessible from request handlers.
pub struct ServerState {
    coedit: Arc<Coedit>,
    config: ServerConfig,
    /// Cancelled first: stops the persister and the sweeper.
    tasks: CancellationToken,
    /// Cancelled last: tells the transport to stop serving.
    closing: CancellationToken,
}

impl ServerState {
    /// Initialize the server: load the document and build the session hub.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let doc = DocumentStore::new(config.doc_path.clone(), config.max_doc_bytes);
        doc.load().await?;
        let image_limits = ImageLimits {
            max_bytes: config.max_image_bytes,
            max_dimension: config.image_max_dimension,
            jpeg_quality: config.image_jpeg_quality,
        };
        Ok(Self {
            coedit: Arc::new(Coedit::new(doc, image_limits)),
            config,
            tasks: CancellationToken::new(),
            closing: CancellationToken::new(),
        })
    }

    /// Initialize server state against a temporary document, for tests.
    pub async fn temporary() -> Result<Self> {
        Self::new(ServerConfig::temporary()).await
    }

    /// The document store backing this server.
    pub fn document(&self) -> &DocumentStore {
        self.coedit.document()
    }

    /// Token cancelled when the transport should stop serving.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Orchestrate a graceful shutdown: stop the savers, flush the document
    /// to disk, tell every client, then close the transport.
    pub async fn shutdown(&self, message: &str) {
        self.tasks.cancel();
        let coedit = Arc::clone(&self.coedit);
        match tokio::task::spawn_blocking(move || coedit.document().save_sync()).await {
            Ok(Ok(())) => info!("final save complete"),
            Ok(Err(e)) => error!("final save failed: {:#}", e),
            Err(e) => error!("final save panicked: {}", e),
        }
        self.coedit.broadcast_all(ServerMsg::ServerShutdown {
            message: message.to_string(),
        });
        self.coedit.kick_all();
        self.closing.cancel();
    }
}

/// Build the router and start the background maintenance tasks.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(persister(
        Arc::clone(&state.coedit),
        state.config.save_interval,
        state.tasks.clone(),
    ));
    tokio::spawn(sweeper(Arc::clone(&state.coedit), state.tasks.clone()));
    Router::new()
        .route("/doc", get(page_handler))
        .route("/socket", get(socket_handler))
        .with_state(state)
}

/// Handler for the `GET /doc` client shell.
async fn page_handler(State(state): State<Arc<ServerState>>) -> Html<String> {
    let page = include_str!("../assets/doc.html").replace(
        "__CURSOR_TIMEOUT__",
        &state.config.cursor_timeout.as_millis().to_string(),
    );
    Html(page)
}

/// Handler for the `GET /socket` transport endpoint.
async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| Arc::clone(&state.coedit).on_connection(socket))
}

/// Writes the document back to disk after edits settle and on a fixed tick.
async fn persister(coedit: Arc<Coedit>, save_interval: Duration, shutdown: CancellationToken) {
    let doc = coedit.document();
    let mut tick = time::interval(save_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = doc.changed() => time::sleep(SAVE_DEBOUNCE).await,
            _ = tick.tick() => {}
        }
        let Some(content) = doc.dirty_snapshot().await else {
            continue;
        };
        let size = content.len();
        if let Err(e) = doc.save_async(content).await {
            error!("when persisting document: {:#}", e);
            doc.mark_dirty().await;
        } else {
            info!("persisted {} bytes to {}", size, doc.path().display());
        }
    }
}

/// Drops sessions whose connections vanished without a disconnect.
async fn sweeper(coedit: Arc<Coedit>, shutdown: CancellationToken) {
    let mut tick = time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => coedit.sweep_stale().await,
        }
    }
}
