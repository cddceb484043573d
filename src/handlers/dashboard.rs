use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::{app::AppState, models::DashboardMessage};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize dashboard frame");
            None
        }
    }
}

/// Sends the backlog once, then every live event until the client goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (history, mut live) = state.events.subscribe_with_history();

    if let Some(msg) = frame(&DashboardMessage::History { events: history }) {
        if sender.send(msg).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = live.recv() => {
                match event {
                    Ok(event) => {
                        let Some(msg) = frame(&event) else { continue };
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Dashboard subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("WebSocket connection closed");
}
