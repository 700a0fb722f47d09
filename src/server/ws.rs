//! WebSocket push endpoint.
//!
//! Each socket is split: a writer task drains an unbounded channel into the
//! sink, and the handler reads frames until the peer goes away. The writer
//! side is what the connection registry holds.

use anyhow::anyhow;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::registry::{Channel, ConnectionRegistry};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Outbound half of one WebSocket.
pub struct WsChannel {
    user_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl WsChannel {
    pub fn new(user_id: impl Into<String>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            user_id: user_id.into(),
            tx,
        }
    }

    fn push(&self, text: String) -> anyhow::Result<()> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow!("websocket for user {} is closed", self.user_id))
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn accept(&self) -> anyhow::Result<()> {
        let hello = serde_json::json!({
            "type": "connected",
            "user_id": self.user_id,
        });
        self.push(hello.to_string())
    }

    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        self.push(text.to_string())
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    authorize_socket(&state, &user_id, query.token.as_deref())?;

    let registry = Arc::clone(&state.registry);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, registry)))
}

/// When `websocket.require_token` is set, the token must be an access token
/// for the user named in the path.
pub fn authorize_socket(state: &AppState, user_id: &str, token: Option<&str>) -> ApiResult<()> {
    if !state.websocket.require_token {
        return Ok(());
    }
    let token = token.ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;
    let claims = state.auth.tokens().authenticate(token)?;
    if claims.sub != user_id {
        return Err(ApiError::unauthorized("Could not validate credentials"));
    }
    Ok(())
}

async fn handle_socket(socket: WebSocket, user_id: String, registry: Arc<ConnectionRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let channel = Arc::new(WsChannel::new(user_id.clone(), tx));
    let connection_id = match registry.register(&user_id, channel).await {
        Ok(id) => id,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "WebSocket handshake failed");
            writer.abort();
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                debug!(user_id = %user_id, len = text.len(), "Ignoring client frame");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    registry.unregister_connection(&user_id, connection_id);
    writer.abort();
    info!(user_id = %user_id, "WebSocket disconnected");
}
