use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use pitchey_core::error::CoreError;
use pitchey_core::types::DbId;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::{authenticate, bearer_token};
use crate::state::AppState;
use crate::ws::registry::WsSender;

/// The only room topic clients can subscribe to.
const NOTIFICATIONS_CHANNEL: &str = "notifications";

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channel: String },
}

/// HTTP handler that authenticates and upgrades the connection to WebSocket.
///
/// The JWT is read from the `Authorization` header or, for browsers that
/// cannot set headers on upgrade requests, the `token` query parameter.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let header = headers.get("authorization").and_then(|v| v.to_str().ok());
    let token = match (header, params.token.as_deref()) {
        (Some(header), _) => bearer_token(header)?,
        (None, Some(token)) => token,
        (None, None) => {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Missing access token".into(),
            )))
        }
    };
    let user = authenticate(token, &state)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user.user_id)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// A sender task forwards outbound frames from the connection's channel to
/// the sink. The connection joins the user's room on `subscribe` and leaves
/// it on disconnect.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: DbId) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, user_id, "WebSocket connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
        }
    });

    let mut subscribed = false;
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Subscribe { channel }) if channel == NOTIFICATIONS_CHANNEL => {
                        if !subscribed {
                            state
                                .rooms
                                .register(user_id, conn_id.clone(), tx.clone())
                                .await;
                            subscribed = true;
                        }
                        json!({"type": "subscribed", "channel": NOTIFICATIONS_CHANNEL})
                    }
                    Ok(ClientMessage::Subscribe { channel }) => {
                        error_frame(&format!("Unknown channel: {channel}"))
                    }
                    Err(_) => error_frame("Unsupported message"),
                };
                send_json(&tx, reply);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    if subscribed {
        state.rooms.unregister(user_id, &conn_id).await;
    }
    send_task.abort();
    tracing::info!(conn_id = %conn_id, user_id, "WebSocket disconnected");
}

fn error_frame(message: &str) -> serde_json::Value {
    json!({"type": "error", "message": message})
}

fn send_json(tx: &WsSender, value: serde_json::Value) {
    let _ = tx.send(Message::Text(value.to_string().into()));
}
