//! Manages the browser WebSocket connection lifecycle for a relay session.

use super::{
    protocol::ServerMessage,
    relay::{self, ClientFrame},
};
use crate::{profile::ProfileKind, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, future, stream::SplitSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const CLIENT_QUEUE: usize = 256;

/// Full assistant session with every capability.
pub async fn assistant_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ProfileKind::Assistant)
}

/// Demo session with external APIs and the knowledge base.
pub async fn realtime_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ProfileKind::Realtime)
}

/// Low-latency conversation without tools.
pub async fn rtc_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    upgrade(ws, state, addr, ProfileKind::Rtc)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    addr: SocketAddr,
    profile: ProfileKind,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, profile))
}

/// Serializes a [`ServerMessage`] onto the socket.
pub async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: ServerMessage) -> Result<()> {
    let json = serde_json::to_string(&msg)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

fn to_frame(msg: Result<Message, axum::Error>) -> Option<ClientFrame> {
    match msg {
        Ok(Message::Text(text)) => Some(ClientFrame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(ClientFrame::Binary(data)),
        Ok(Message::Close(_)) => Some(ClientFrame::Close),
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(e) => {
            debug!(error = %e, "Client socket error");
            Some(ClientFrame::Close)
        }
    }
}

#[instrument(name = "ws_connection", skip_all, fields(session_id, %addr, %profile))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr, profile: ProfileKind) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", tracing::field::display(session_id));
    info!("New WebSocket connection");

    let (mut socket_tx, socket_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::channel::<ServerMessage>(CLIENT_QUEUE);

    // The only task that writes to the socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if let Err(e) = send_msg(&mut socket_tx, msg).await {
                debug!(error = %e, "Client socket closed while sending");
                break;
            }
        }
        let _ = socket_tx.close().await;
    });

    let frames = socket_rx.filter_map(|msg| future::ready(to_frame(msg)));
    let summary = relay::run_session(state.session_context(session_id, profile), frames, client_tx).await;
    info!(?summary, "Relay finished");

    if let Err(e) = writer.await {
        warn!(error = %e, "Client writer task failed");
    }
}
