//! Viewer and producer WebSocket endpoints

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::{AUTH_REJECTED_CLOSE_CODE, DEFAULT_ROOM};
use crate::error::BroadcastError;
use crate::protocol::{ClientMessage, ProducerMessage, ServerMessage};
use crate::server::server::AppState;

/// Query string of both socket endpoints
#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    pub token: Option<String>,
    pub room: Option<String>,
}

impl SocketParams {
    fn room(&self) -> String {
        self.room
            .as_deref()
            .filter(|room| !room.is_empty())
            .unwrap_or(DEFAULT_ROOM)
            .to_string()
    }
}

/// Viewer socket upgrade
pub async fn viewer_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SocketParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_viewer(socket, addr, params, state))
}

/// Producer socket upgrade
pub async fn producer_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SocketParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_producer(socket, addr, params, state))
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: AUTH_REJECTED_CLOSE_CODE,
        reason: Cow::from("Unauthorized"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_viewer(socket: WebSocket, addr: SocketAddr, params: SocketParams, state: Arc<AppState>) {
    let room = params.room();
    if state.broadcaster.authorize(params.token.as_deref()).is_err() {
        tracing::warn!("Rejected viewer {}: bad token", addr);
        reject(socket).await;
        return;
    }

    state.open_room(&room);
    let (id, mut outbound) = match state
        .broadcaster
        .accept_connection(addr, params.token.as_deref(), &room)
    {
        Ok(accepted) => accepted,
        Err(_) => {
            reject(socket).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let _ = state.broadcaster.send_to(id, &state.snapshot(&room));
    let _ = state.broadcaster.send_to(
        id,
        &ServerMessage::Rooms {
            rooms: state.store.rooms(),
        },
    );

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(command) => {
                    if let Err(e) = handle_viewer_message(&state, id, command) {
                        tracing::debug!("Viewer {} command failed: {}", id, e);
                    }
                }
                Err(e) => tracing::debug!("Ignoring malformed frame from viewer {}: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Viewer {} socket error: {}", id, e);
                break;
            }
        }
    }

    state.broadcaster.remove_viewer(id);
    writer.abort();
}

/// Apply one viewer command
pub fn handle_viewer_message(
    state: &AppState,
    id: Uuid,
    message: ClientMessage,
) -> Result<(), BroadcastError> {
    let broadcaster = &state.broadcaster;
    match message {
        ClientMessage::Pause => broadcaster.set_viewer_paused(id, true),
        ClientMessage::Resume => broadcaster.set_viewer_paused(id, false),
        ClientMessage::SubscribeStream { channel } => broadcaster.subscribe_stream(id, &channel),
        ClientMessage::UnsubscribeStream { channel } => broadcaster.unsubscribe_stream(id, &channel),
        ClientMessage::PauseStream { channel } => broadcaster.pause_stream(id, &channel),
        ClientMessage::ResumeStream { channel } => broadcaster.resume_stream(id, &channel),
        ClientMessage::Ping { timestamp } => {
            broadcaster.send_to(id, &ServerMessage::Pong { timestamp })?;
            Ok(())
        }
        ClientMessage::SwitchRoom { room } => {
            state.open_room(&room);
            broadcaster.switch_room(id, &room)?;
            broadcaster.send_to(id, &state.snapshot(&room))?;
            Ok(())
        }
    }
}

async fn handle_producer(socket: WebSocket, addr: SocketAddr, params: SocketParams, state: Arc<AppState>) {
    if state.broadcaster.authorize(params.token.as_deref()).is_err() {
        tracing::warn!("Rejected producer {}: bad token", addr);
        reject(socket).await;
        return;
    }

    let room = params.room();
    let producers = state.broadcaster.producer_connected();
    tracing::info!("Producer {} connected to room '{}' ({} total)", addr, room, producers);
    state
        .broadcaster
        .broadcast_all(&ServerMessage::ClientConnect { producers });

    let (_sender, mut receiver) = socket.split();
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ProducerMessage::parse(&text) {
                Ok(message) => {
                    state.ingest(&room, message);
                }
                Err(e) => tracing::debug!("Ignoring malformed frame from producer {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Producer {} socket error: {}", addr, e);
                break;
            }
        }
    }

    let producers = state.broadcaster.producer_disconnected();
    tracing::info!("Producer {} disconnected ({} remaining)", addr, producers);
    state
        .broadcaster
        .broadcast_all(&ServerMessage::ClientDisconnect { producers });
}
