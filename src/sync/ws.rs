//! WebSocket + REST surface of the durable context.
//!
//! `/ws` carries `ClientFrame` requests and answers with `ServerFrame`s;
//! notifications are pushed on the same socket as they happen.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::bus::MessageBus;
use super::protocol::{ClientFrame, Notification, Request, Response, ServerFrame};
use crate::error::SyncError;
use crate::jobs::JobChange;

#[derive(Clone)]
pub struct SyncState {
    pub bus: Arc<dyn MessageBus>,
}

/// Build the router for the protocol socket and read-mostly REST routes.
pub fn sync_routes(bus: Arc<dyn MessageBus>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/star", post(toggle_star))
        .route("/api/clear", post(clear_all))
        .with_state(SyncState { bus })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "apply-pilot"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SyncState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.bus))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            true
        }
    }
}

/// Push current state and counts so a fresh or lagging client can resync.
async fn send_snapshot(socket: &mut WebSocket, bus: &dyn MessageBus) -> bool {
    let state = match bus.request(Request::GetState).await.and_then(Response::into_state) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Could not read state for snapshot");
            return true;
        }
    };
    let counts = match bus.request(Request::GetJobs).await.and_then(Response::into_jobs) {
        Ok((_, counts)) => counts,
        Err(e) => {
            warn!(error = %e, "Could not read jobs for snapshot");
            return true;
        }
    };
    send_frame(
        socket,
        &ServerFrame::Notification {
            notification: Notification::StateChanged { state },
        },
    )
    .await
        && send_frame(
            socket,
            &ServerFrame::Notification {
                notification: Notification::JobsChanged { counts },
            },
        )
        .await
}

async fn handle_socket(mut socket: WebSocket, bus: Arc<dyn MessageBus>) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing falls between the two.
    let mut rx = bus.subscribe();
    if !send_snapshot(&mut socket, bus.as_ref()).await {
        warn!("Failed to send initial snapshot, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(notification) => {
                        if !send_frame(&mut socket, &ServerFrame::Notification { notification }).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind notifications");
                        if !send_snapshot(&mut socket, bus.as_ref()).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Notification channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let frame = handle_client_frame(&text, bus.as_ref()).await;
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn handle_client_frame(text: &str, bus: &dyn MessageBus) -> ServerFrame {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Unrecognized WS frame from client");
            return ServerFrame::Invalid {
                reason: e.to_string(),
            };
        }
    };

    let label = frame.request.label();
    match bus.request(frame.request).await {
        Ok(response) => ServerFrame::Response {
            request_id: frame.request_id,
            response,
        },
        Err(e) => {
            warn!(request = label, error = %e, "Request failed");
            ServerFrame::Invalid {
                reason: e.to_string(),
            }
        }
    }
}

// ── REST ────────────────────────────────────────────────────────────────

fn sync_failure(e: SyncError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        SyncError::Rejected(crate::error::JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
        SyncError::Rejected(_) => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

async fn get_state(State(state): State<SyncState>) -> impl IntoResponse {
    match state.bus.request(Request::GetState).await.and_then(Response::into_state) {
        Ok(app_state) => (StatusCode::OK, Json(serde_json::json!({ "state": app_state }))),
        Err(e) => sync_failure(e),
    }
}

async fn list_jobs(State(state): State<SyncState>) -> impl IntoResponse {
    match state.bus.request(Request::GetJobs).await.and_then(Response::into_jobs) {
        Ok((jobs, counts)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "jobs": jobs, "counts": counts })),
        ),
        Err(e) => sync_failure(e),
    }
}

async fn get_job(State(state): State<SyncState>, Path(id): Path<String>) -> impl IntoResponse {
    match state
        .bus
        .request(Request::GetJob { job_id: id.clone() })
        .await
        .and_then(Response::into_job)
    {
        Ok(Some(job)) => (StatusCode::OK, Json(serde_json::json!({ "job": job }))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Job {id} not found") })),
        ),
        Err(e) => sync_failure(e),
    }
}

async fn toggle_star(State(state): State<SyncState>, Path(id): Path<String>) -> impl IntoResponse {
    let request = Request::UpdateJob {
        job_id: id.clone(),
        change: JobChange::ToggleStar,
    };
    match state.bus.request(request).await.and_then(Response::into_updated_job) {
        Ok(job) => {
            info!(job_id = %id, starred = job.starred, "Star toggled via REST");
            (StatusCode::OK, Json(serde_json::json!({ "job": job })))
        }
        Err(e) => sync_failure(e),
    }
}

async fn clear_all(State(state): State<SyncState>) -> impl IntoResponse {
    match state.bus.request(Request::ClearAll).await.and_then(Response::into_cleared) {
        Ok(removed) => {
            info!(removed, "Cleared via REST");
            (StatusCode::OK, Json(serde_json::json!({ "removed": removed })))
        }
        Err(e) => sync_failure(e),
    }
}
