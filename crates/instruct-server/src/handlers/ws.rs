//! WebSocket endpoint.
//!
//! Adapts axum's socket to [`SessionProtocol`]: inbound text messages become
//! the request stream and frames are serialized as JSON text messages.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{future, SinkExt, StreamExt};

use crate::{models::Frame, session::SessionProtocol, state::AppState};

/// Handler for `GET /ws`.
pub async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();

    // A close frame or transport error ends the request stream.
    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    let outbound = sender.with(|frame: Frame| {
        future::ready(
            serde_json::to_string(&frame)
                .map(|json| Message::Text(json.into()))
                .map_err(axum::Error::new),
        )
    });

    SessionProtocol::new(state)
        .run(Box::pin(inbound), Box::pin(outbound))
        .await;
}
