//! # Transport Adapter Module
//!
//! Accepts WebSocket connections and shuttles frames between peers and the
//! [`SessionRegistry`](crate::registry::SessionRegistry). One endpoint
//! carries every session: frames are routed by the session id they name, so
//! a single browser connection can drive any number of terminals.
//!
//! Per socket the adapter runs a writer task draining the connection's
//! outbound channel into the sink, while the read loop feeds inbound text
//! frames to the registry. When either side ends, the connection is marked
//! closed and removed from every session.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use crate::connection::{Connection, Outbound};
use crate::pty::{NativePtyBackend, default_shell};
use crate::registry::SessionRegistry;
use crate::replay::DEFAULT_REPLAY_LIMIT;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Serve multiplexed shell sessions over a WebSocket endpoint"
)]
pub struct Args {
    /// Host to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the server
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Shell to run inside sessions (defaults to $SHELL, then /bin/bash)
    #[arg(long)]
    pub shell: Option<String>,

    /// Maximum bytes of output buffered per session for replay
    #[arg(long, default_value_t = DEFAULT_REPLAY_LIMIT)]
    pub replay_limit: usize,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
}

/// Starts the WebSocket server and blocks until it shuts down.
pub async fn run_server(args: Args) -> Result<()> {
    let shell = args.shell.unwrap_or_else(default_shell);
    let backend = Arc::new(NativePtyBackend::new(shell));
    let registry = Arc::new(SessionRegistry::new(backend, args.replay_limit));

    // Clients need this token in their HELLO; it changes on every restart.
    info!("server identity token: {}", registry.token());

    let app = Router::new()
        .route("/ws", get(handle_ws))
        .with_state(AppState {
            registry: registry.clone(),
        });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {} (WebSocket endpoint at /ws)", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound_rx) = Connection::new();

    info!(connection = %conn.id(), "websocket connected");

    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            match event {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        writer_conn.mark_closed();
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => registry.route(&conn, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(connection = %conn.id(), "websocket error: {err}");
                break;
            }
            // Binary, ping and pong frames are not part of the protocol.
            _ => {}
        }
    }

    registry.on_connection_close(&conn).await;
    writer.abort();

    info!(connection = %conn.id(), "websocket disconnected");
}
