//! Relay gateway: environment REST endpoints and the terminal websocket.
//!
//! The websocket handshake carries the target instance id in the path
//! (`/ws/terminal/{instanceId}`). Validation happens before any resource is
//! allocated: a rejected handshake spawns no process and inserts nothing
//! into the session registry.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::error::RelayError;
use crate::lifecycle::{EnvStatus, LifecycleManager};
use crate::protocol::{CLOSE_OCCUPIED, CLOSE_REJECTED, CLOSE_SPAWN_FAILED};
use crate::pty::ProcessSpawner;
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Initial PTY geometry before the client reports its own.
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<SessionRegistry>,
    pub spawner: Arc<dyn ProcessSpawner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/environment/start/{challenge_id}", post(start_environment))
        .route("/api/environment/stop/{instance_id}", post(stop_environment))
        .route("/api/environment/instance/{instance_id}", get(instance_status))
        .route("/api/environment/instances", get(list_instances))
        .route("/ws/terminal/{instance_id}", get(terminal_ws))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "challenge-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_environment(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
) -> Response {
    match state.lifecycle.start(&challenge_id).await {
        Ok(env) => Json(env).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_environment(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.lifecycle.stop(&instance_id).await {
        Ok(env) => Json(env).into_response(),
        Err(e) => error_response(e),
    }
}

async fn instance_status(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.lifecycle.status(&instance_id) {
        Some(env) => Json(env).into_response(),
        None => error_response(RelayError::NotFound(instance_id)),
    }
}

async fn list_instances(State(state): State<AppState>) -> Response {
    Json(state.lifecycle.list()).into_response()
}

fn error_response(error: RelayError) -> Response {
    let status = match &error {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        RelayError::Provision(_) | RelayError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn terminal_ws(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(state, instance_id, socket))
}

async fn handle_terminal(state: AppState, instance_id: String, socket: WebSocket) {
    // Validate before allocating anything.
    let env = match state.lifecycle.status(&instance_id) {
        Some(env) => env,
        None => {
            tracing::info!(
                target = "challenge_relay::gateway",
                instance = %instance_id,
                "rejecting terminal: unknown instance"
            );
            close_with(socket, CLOSE_REJECTED, "instance not found").await;
            return;
        }
    };
    if env.status != EnvStatus::Running || env.is_past_deadline(chrono::Utc::now()) {
        tracing::info!(
            target = "challenge_relay::gateway",
            instance = %instance_id,
            status = env.status.as_str(),
            "rejecting terminal: instance not running"
        );
        close_with(socket, CLOSE_REJECTED, "instance not running").await;
        return;
    }

    // Registry insertion is the arbiter for the one-session-per-instance
    // invariant.
    let token = match state.registry.insert(&instance_id) {
        Ok(token) => token,
        Err(_) => {
            close_with(socket, CLOSE_OCCUPIED, "already attached").await;
            return;
        }
    };

    let status_rx = match state.lifecycle.subscribe(&instance_id) {
        Some(rx) => rx,
        // Entry vanished between validation and attach.
        None => {
            state.registry.remove(&instance_id, token);
            close_with(socket, CLOSE_REJECTED, "instance not running").await;
            return;
        }
    };
    // A stop racing the handshake may have landed between the status check
    // and the subscription; the receiver's current value closes that window.
    // A transition after this point wakes the session's watch arm instead.
    if *status_rx.borrow() != EnvStatus::Running {
        state.registry.remove(&instance_id, token);
        close_with(socket, CLOSE_REJECTED, "instance not running").await;
        return;
    }

    let (process, output_rx) =
        match state
            .spawner
            .spawn(&env.container_name, DEFAULT_ROWS, DEFAULT_COLS)
        {
            Ok(spawned) => spawned,
            Err(e) => {
                // The environment stays RUNNING so a retry can attach.
                state.registry.remove(&instance_id, token);
                tracing::warn!(
                    target = "challenge_relay::gateway",
                    instance = %instance_id,
                    error = %e,
                    "pty spawn failed"
                );
                close_with(socket, CLOSE_SPAWN_FAILED, "failed to attach to container").await;
                return;
            }
        };

    let mut socket = socket;
    let banner = format!(
        "\r\n=== Connected to Challenge Container ===\r\nInstance: {}\r\nExpires: {}\r\n========================================\r\n\r\n",
        env.instance_id,
        env.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );
    if socket.send(Message::Text(banner.into())).await.is_err() {
        // Client vanished during attach; release everything we just took.
        process.terminate();
        state.registry.remove(&instance_id, token);
        return;
    }

    let session = Session::new(&instance_id, token, state.registry.clone(), process);
    session.run(socket, output_rx, status_rx).await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
