//! REST surface and WebSocket broadcast for external observers (§6.4). This
//! is the thin transport shell around the Controller and Broadcaster —
//! everything it serves is already computed by those two components.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::bus::{EventKind, SharedBroadcaster};
use crate::hooks::ingress::ControllerSlot;

#[derive(Clone)]
pub struct RestState {
    pub controller: ControllerSlot,
    pub broadcaster: SharedBroadcaster,
}

pub fn build_rest_router(state: RestState) -> Router {
    Router::new()
        .route("/api/session", get(get_session))
        .route("/api/transcript", get(get_transcript))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn get_session(State(state): State<RestState>) -> Response {
    match state.controller.read().await.clone() {
        Some(controller) => (StatusCode::OK, Json(controller.status_report().await)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "not initialised"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    path: String,
}

/// Reads a JSONL transcript by absolute path. Rejects anything not ending
/// in `.jsonl`; malformed lines become `{"raw": line}` rather than failing
/// the whole read, mirroring the transcript extraction rule's "skip
/// malformed lines silently".
async fn get_transcript(Query(query): Query<TranscriptQuery>) -> Response {
    if !query.path.ends_with(".jsonl") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "path must end with .jsonl"})),
        )
            .into_response();
    }

    match tokio::fs::read_to_string(&query.path).await {
        Ok(contents) => {
            let lines: Vec<serde_json::Value> = contents
                .lines()
                .map(|line| serde_json::from_str(line).unwrap_or_else(|_| json!({"raw": line})))
                .collect();
            (StatusCode::OK, Json(json!({"lines": lines}))).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("failed to read transcript: {e}")})),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RestState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Observer-only: inbound frames are drained and ignored, purely so a
/// client-initiated close is detected promptly. Removed from the
/// Broadcaster's connection set on first failed send or socket close.
async fn handle_socket(mut socket: WebSocket, state: RestState) {
    let (id, mut rx) = state.broadcaster.subscribe().await;
    state
        .broadcaster
        .publish(EventKind::Connected, json!({"client_id": id}))
        .await;

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        let Ok(text) = serde_json::to_string(&envelope) else { continue };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    state.broadcaster.unsubscribe(id).await;
}
