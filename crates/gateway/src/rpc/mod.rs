//! JSON-RPC 2.0 over WebSocket — the primary client transport.
//!
//! Generalizes [`crate::nodes::ws`]'s connection shape (per-connection
//! outbound `mpsc` + writer task + reader loop) to a JSON-RPC 2.0 envelope
//! with a method dispatch table (see [`methods`]), plus a [`broadcast`] hub
//! so a connection can subscribe to topics and receive server-pushed
//! notifications alongside request/response traffic.
//!
//! Unlike `/v1/nodes/ws`, `/v1/rpc` carries no handshake of its own: the
//! route is mounted in the protected router group, so
//! `auth::require_api_token` has already validated the caller's bearer
//! token before the upgrade completes.

pub mod broadcast;
pub mod methods;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reserved JSON-RPC 2.0 codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Domain-specific codes, outside the reserved `-32768..-32000` range's
/// pre-assigned slots.
pub const NOT_FOUND: i64 = -32000;
pub const FORBIDDEN: i64 = -32001;
pub const UNAVAILABLE: i64 = -32002;
pub const TIMEOUT: i64 = -32003;
pub const QUEUE_FULL: i64 = -32004;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent `id` means this is a notification: dispatched, but no
    /// response is sent back even if it errors.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

pub type RpcResult = Result<Value, RpcError>;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RpcOutbound {
    Response {
        jsonrpc: &'static str,
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    Notification {
        jsonrpc: &'static str,
        method: String,
        params: Value,
    },
}

impl RpcOutbound {
    pub fn ok(id: Value, result: Value) -> Self {
        RpcOutbound::Response {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        RpcOutbound::Response {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        RpcOutbound::Notification {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /v1/rpc — upgrade to a JSON-RPC 2.0 WebSocket session.
pub async fn rpc_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let conn_id = uuid::Uuid::new_v4();

    let (out_tx, mut out_rx) = mpsc::channel::<RpcOutbound>(128);
    state.rpc_broadcast.connect(conn_id, out_tx.clone());

    tracing::info!(conn_id = %conn_id, "rpc connection established");

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Some(reply) = handle_one(&state, conn_id, &text).await {
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.rpc_broadcast.disconnect(conn_id);
    tracing::info!(conn_id = %conn_id, "rpc connection closed");
}

async fn handle_one(state: &AppState, conn_id: uuid::Uuid, text: &str) -> Option<RpcOutbound> {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return Some(RpcOutbound::err(
                Value::Null,
                RpcError::new(PARSE_ERROR, format!("invalid JSON-RPC envelope: {e}")),
            ));
        }
    };

    let id = request.id.clone();
    let outcome = methods::dispatch(state, conn_id, &request.method, request.params).await;

    // A notification (no `id`) gets no response, success or failure.
    let id = id?;
    Some(match outcome {
        Ok(result) => RpcOutbound::ok(id, result),
        Err(error) => RpcOutbound::err(id, error),
    })
}
