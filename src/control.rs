//! Control surface — REST + streaming endpoints for the UI collaborator.
//! `axum::Router` with `with_state`, one handler per route, CORS left open
//! by design since the tool is local.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::analyzer::Analyzer;
use crate::hub::Hub;
use crate::store::Store;

/// Shared state for the control-surface routes.
pub struct ControlState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<Hub>,
    pub analyzer: Arc<Analyzer>,
    pub trace_id: String,
}

/// Builds the axum `Router` serving `/health`, `/api/*`, and `/ws`.
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/trace", get(get_trace))
        .route("/api/messages", get(get_messages))
        .route("/api/agents", get(get_agents))
        .route("/api/insights", get(get_insights))
        .route("/api/summary", get(get_summary))
        .route("/api/export", get(export_trace))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "OK"
}

async fn get_trace(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.store.get_trace(&state.trace_id).await {
        Ok(trace) => Json(trace).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_messages(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.store.get_messages(&state.trace_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_agents(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.store.get_agents().await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_insights(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.store.get_insights(&state.trace_id).await {
        Ok(insights) => Json(insights).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_summary(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    Json(state.analyzer.summary().await).into_response()
}

async fn export_trace(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.store.export_trace(&state.trace_id).await {
        Ok(export) => {
            let body = match serde_json::to_string_pretty(&export) {
                Ok(s) => s,
                Err(e) => return error_response(crate::error::TraceError::Store(e.to_string())),
            };
            let filename = format!("trace-{}.json", export.trace.id);
            (
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename={filename}"),
                    ),
                ],
                body,
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(err: crate::error::TraceError) -> Response {
    let status = match &err {
        crate::error::TraceError::TraceNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ControlState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

/// Per-observer session: forwards Hub broadcasts to the socket, answers
/// `ping` control frames with `pong`, and closes on read-deadline silence.
async fn handle_observer(mut socket: WebSocket, state: Arc<ControlState>) {
    use futures::StreamExt;

    let (session_id, mut rx) = state.hub.register().await;
    let read_deadline = std::time::Duration::from_secs(60);

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if socket.send(WsMessage::Text((*payload).into())).await.is_err() {
                    break;
                }
            }
            frame = tokio::time::timeout(read_deadline, socket.next()) => {
                match frame {
                    Ok(Some(Ok(WsMessage::Text(text)))) => {
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("ping")
                                && socket.send(WsMessage::Text("{\"type\":\"pong\"}".into())).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!("observer read error: {e}");
                        break;
                    }
                    Err(_) => {
                        debug!("observer read deadline exceeded, closing");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(session_id).await;
}
