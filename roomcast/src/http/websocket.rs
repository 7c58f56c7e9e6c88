//! Signaling WebSocket
//!
//! One socket per participant connection. Text frames carry the JSON
//! envelope in both directions; the connection leaves its room when the
//! socket closes or the SFU closes the connection.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use roomcast_sfu::{ChannelSignalSink, ParticipantId, RoomId, SfuError, SignalMessage};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::http::{AppError, AppResult, AppState};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub room: Option<String>,
    /// Generated when absent
    pub participant: Option<String>,
}

impl WsQuery {
    fn resolve(self) -> AppResult<(RoomId, ParticipantId)> {
        let room = self
            .room
            .filter(|room| !room.trim().is_empty())
            .ok_or_else(|| AppError::bad_request("Missing room query parameter"))?;
        let participant = self
            .participant
            .filter(|p| !p.trim().is_empty())
            .map_or_else(ParticipantId::generate, ParticipantId::from);
        Ok((RoomId::from(room), participant))
    }
}

/// Close code telling the client why its join was rejected
fn join_close_code(err: &SfuError) -> u16 {
    match err {
        SfuError::InvalidRoomId => close_code::POLICY,
        SfuError::RoomFull(_) | SfuError::RoomLimit => close_code::AGAIN,
        SfuError::ShuttingDown => close_code::AWAY,
        SfuError::Transport(_) | SfuError::Signal(_) | SfuError::ConnectionClosed => {
            close_code::ERROR
        }
    }
}

/// `GET /ws?room=<id>&participant=<id>`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let (room_id, participant) = query.resolve()?;
    if state.sfu.is_shutting_down() {
        return Err(AppError::service_unavailable("Server is shutting down"));
    }

    Ok(ws
        .max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id, participant)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    room_id: RoomId,
    participant: ParticipantId,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (signal, mut outbound) = ChannelSignalSink::channel();

    let connection = match state
        .sfu
        .join(room_id.clone(), participant.clone(), Arc::new(signal))
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            warn!(room_id = %room_id, participant = %participant, error = %e, "Join rejected");
            let _ = ws_sink
                .send(Message::Close(Some(CloseFrame {
                    code: join_close_code(&e),
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    info!(
        room_id = %room_id,
        participant = %participant,
        connection_id = %connection.id,
        "WebSocket connection established"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode signaling message");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = connection.closed_token().cancelled() => break,
            _ = &mut send_task => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match SignalMessage::from_json(text.as_str()) {
                Ok(message) => {
                    if let Err(e) = state.sfu.handle_message(&connection, message).await {
                        warn!(connection_id = %connection.id, error = %e, "Signaling message failed");
                    }
                }
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "Malformed signaling message");
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(connection_id = %connection.id, error = %e, "WebSocket error");
                break;
            }
            // Ping, pong and binary frames carry no signaling
            Some(Ok(_)) => {}
        }
    }

    state.sfu.leave(&connection).await;
    send_task.abort();

    info!(
        room_id = %room_id,
        participant = %participant,
        connection_id = %connection.id,
        "WebSocket connection closed"
    );
}
