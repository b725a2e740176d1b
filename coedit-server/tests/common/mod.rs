use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON messages.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let msg = self
                .0
                .next()
                .await
                .ok_or_else(|| anyhow!("WebSocket closed"))??;
            match msg {
                // The server pings for liveness; skip those frames.
                Message::Ping(_) | Message::Pong(_) => continue,
                msg => {
                    let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
                    return Ok(serde_json::from_str(msg)?);
                }
            }
        }
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(_)) => return Ok(()),
                other => return Err(anyhow!("WebSocket should be closed, got {:?}", other)),
            }
        }
    }
}

pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        Ok(Self { addr })
    }

    pub async fn connect(&self) -> Result<JsonSocket> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/socket", self.addr)).await?;
        Ok(JsonSocket(socket))
    }
}

/// Identify the socket as `user_id` and return the `init` reply.
pub async fn identify(
    socket: &mut JsonSocket,
    user_id: &str,
    name: &str,
    color: &str,
) -> Result<Value> {
    socket
        .send(&json!({
            "userJoined": { "userId": user_id, "name": name, "color": color }
        }))
        .await;
    socket.recv().await
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
