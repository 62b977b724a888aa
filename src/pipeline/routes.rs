//! HTTP and WebSocket surface of the pipeline controller.
//!
//! Commands are accepted and run in the background; progress arrives as
//! `PipelineEvent`s on `/ws/pipeline`. `/ws/extraction` is where the page
//! extraction environment connects to serve `ExtractionCommand`s.

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
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::controller::{Command, PipelineController, PipelineEvent};
use crate::config::Profile;
use crate::ports::ExtractionLink;
use crate::store::Database;
use crate::sync::{ExtractionCommand, ExtractionEvent};

#[derive(Clone)]
pub struct PipelineRouteState {
    pub controller: Arc<PipelineController>,
    pub settings: Arc<dyn Database>,
    /// Served by at most one extraction environment at a time.
    pub extraction: Arc<Mutex<ExtractionLink>>,
}

pub fn pipeline_routes(state: PipelineRouteState) -> Router {
    Router::new()
        .route("/ws/pipeline", get(pipeline_ws))
        .route("/ws/extraction", get(extraction_ws))
        .route("/api/pipeline", get(pipeline_status))
        .route("/api/pipeline/start", post(start))
        .route("/api/pipeline/pause", post(pause))
        .route("/api/pipeline/approve", post(approve))
        .route("/api/pipeline/decline", post(decline))
        .route("/api/jobs/{id}/process", post(process_job))
        .route("/api/profile", get(get_profile).put(put_profile))
        .with_state(state)
}

// ── Commands ────────────────────────────────────────────────────────────

fn accept(state: &PipelineRouteState, command: Command) -> (StatusCode, Json<serde_json::Value>) {
    let label = command.label();
    info!(command = label, "Command accepted");
    state.controller.dispatch(command);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": label })),
    )
}

async fn start(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    accept(&state, Command::Start)
}

async fn pause(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    accept(&state, Command::Pause)
}

async fn approve(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    accept(&state, Command::Approve)
}

async fn decline(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    accept(&state, Command::Decline)
}

async fn process_job(
    State(state): State<PipelineRouteState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    accept(&state, Command::Process { job_id: id })
}

/// GET /api/pipeline
///
/// What the controller is doing right now.
async fn pipeline_status(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    let in_flight = state
        .controller
        .in_flight()
        .await
        .map(|(job_id, stage)| serde_json::json!({ "job_id": job_id, "stage": stage.to_string() }));
    Json(serde_json::json!({ "in_flight": in_flight }))
}

// ── Profile ─────────────────────────────────────────────────────────────

/// GET /api/profile
///
/// The stored profile with the credential redacted, or 404.
async fn get_profile(State(state): State<PipelineRouteState>) -> impl IntoResponse {
    match Profile::load(state.settings.as_ref()).await {
        Ok(Some(profile)) => (StatusCode::OK, Json(profile.redacted())),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No profile has been configured" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// PUT /api/profile
async fn put_profile(
    State(state): State<PipelineRouteState>,
    Json(profile): Json<Profile>,
) -> impl IntoResponse {
    match profile.save(state.settings.as_ref()).await {
        Ok(()) => {
            info!(keywords = %profile.search_terms(), "Profile updated");
            (StatusCode::OK, Json(profile.redacted()))
        }
        Err(e) => {
            warn!(error = %e, "Failed to save profile");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

// ── Pipeline socket ─────────────────────────────────────────────────────

async fn pipeline_ws(
    ws: WebSocketUpgrade,
    State(state): State<PipelineRouteState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_pipeline_socket(socket, state.controller))
}

async fn send_event(socket: &mut WebSocket, event: &PipelineEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode pipeline event");
            true
        }
    }
}

async fn handle_pipeline_socket(mut socket: WebSocket, controller: Arc<PipelineController>) {
    info!("Pipeline client connected");
    let mut rx = controller.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Pipeline client lagged behind events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Command>(&text) {
                            Ok(command) => {
                                debug!(command = command.label(), "Command from socket");
                                controller.dispatch(command);
                            }
                            Err(e) => {
                                let rejected = PipelineEvent::Failed {
                                    command: "unknown".into(),
                                    reason: e.to_string(),
                                };
                                if !send_event(&mut socket, &rejected).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Pipeline socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Pipeline client disconnected");
}

// ── Extraction environment socket ───────────────────────────────────────

async fn extraction_ws(
    ws: WebSocketUpgrade,
    State(state): State<PipelineRouteState>,
) -> axum::response::Response {
    let Ok(link) = Arc::clone(&state.extraction).try_lock_owned() else {
        warn!("Second extraction environment refused");
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "An extraction environment is already connected" })),
        )
            .into_response();
    };
    ws.on_upgrade(|socket| serve_extraction(socket, link, state.controller))
}

/// Forward commands to the environment and its events back to the adapter.
///
/// A stalled pipeline is resumed once the environment is connected.
async fn serve_extraction(
    mut socket: WebSocket,
    mut link: OwnedMutexGuard<ExtractionLink>,
    controller: Arc<PipelineController>,
) {
    link.set_connected(true);
    info!("Extraction environment connected");
    tokio::spawn(async move {
        if let Err(e) = controller.resume(false).await {
            warn!(error = %e, "Resume after extraction connect failed");
        }
    });

    loop {
        tokio::select! {
            outbound = link.commands.recv() => {
                let Some(outbound) = outbound else {
                    debug!("Extraction adapter dropped");
                    break;
                };
                if outbound.is_abandoned() {
                    warn!(command = outbound.command.label(), "Dropping expired extraction command");
                    continue;
                }
                if !send_command(&mut socket, &outbound.command).await {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ExtractionEvent>(&text) {
                            Ok(event) => {
                                if link.events.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Unrecognized extraction event"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Extraction socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    link.set_connected(false);
    info!("Extraction environment disconnected");
}

async fn send_command(socket: &mut WebSocket, command: &ExtractionCommand) -> bool {
    match serde_json::to_string(command) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode extraction command");
            true
        }
    }
}
