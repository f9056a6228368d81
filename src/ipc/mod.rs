//! HTTP API for the front end: lifecycle state, menu, actions and console.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::supervisor::menu::MenuEntry;
use crate::supervisor::state_machine::EffectiveState;
use crate::supervisor::Supervisor;

/// Default number of console lines returned without `since`.
const DEFAULT_CONSOLE_COUNT: usize = 200;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Respond only after the action finished (install) or the app is ready (launch).
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResponse {
    pub installed: bool,
    pub installing: bool,
    pub running: bool,
    pub endpoint: Option<String>,
    pub effective: EffectiveState,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuResponse {
    pub title: String,
    pub entries: Vec<MenuEntry>,
}

#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/state", get(get_state))
            .route("/api/menu", get(get_menu))
            .route("/api/install", post(install_handler))
            .route("/api/reinstall", post(reinstall_handler))
            .route("/api/launch", post(launch_handler))
            .route("/api/stop", post(stop_handler))
            .route("/api/console", get(get_console))
            .route("/api/local", get(get_local))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// GET /api/state
async fn get_state(State(state): State<IPCServer>) -> impl IntoResponse {
    let sup = &state.supervisor;
    match sup.state() {
        Ok(s) => Json(StateResponse {
            effective: s.effective(),
            installed: s.installed,
            installing: s.installing,
            running: s.running,
            endpoint: s.endpoint,
            last_error: sup.last_error(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/menu - recomputed on every call
async fn get_menu(State(state): State<IPCServer>) -> impl IntoResponse {
    match state.supervisor.menu() {
        Ok(entries) => Json(MenuResponse {
            title: state.supervisor.config().title.clone(),
            entries,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/install
async fn install_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<ActionRequest>>,
) -> impl IntoResponse {
    let req = payload.map(|j| j.0).unwrap_or_default();
    if req.wait {
        return match state.supervisor.install().await {
            Ok(()) => (StatusCode::OK, Json(json!({"success": true}))).into_response(),
            Err(e) => e.into_response(),
        };
    }

    let sup = state.supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = sup.install().await {
            tracing::error!("Background install failed: {}", e);
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "message": "Install started"})),
    )
        .into_response()
}

/// POST /api/reinstall
async fn reinstall_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<ActionRequest>>,
) -> impl IntoResponse {
    let req = payload.map(|j| j.0).unwrap_or_default();
    if req.wait {
        return match state.supervisor.reinstall().await {
            Ok(()) => (StatusCode::OK, Json(json!({"success": true}))).into_response(),
            Err(e) => e.into_response(),
        };
    }

    let sup = state.supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = sup.reinstall().await {
            tracing::error!("Background reinstall failed: {}", e);
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "message": "Reinstall started"})),
    )
        .into_response()
}

/// POST /api/launch
async fn launch_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<ActionRequest>>,
) -> impl IntoResponse {
    let req = payload.map(|j| j.0).unwrap_or_default();
    let readiness = match state.supervisor.launch().await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let pid = state.supervisor.running_pid().await;

    if !req.wait {
        return (
            StatusCode::ACCEPTED,
            Json(json!({"success": true, "pid": pid, "message": "Launch started"})),
        )
            .into_response();
    }

    match readiness.wait().await {
        Ok(endpoint) => (
            StatusCode::OK,
            Json(json!({"success": true, "pid": pid, "endpoint": endpoint})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/stop
async fn stop_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    match state.supervisor.stop().await {
        Ok(info) => (
            StatusCode::OK,
            Json(json!({"success": true, "exit_code": info.code})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/console?since=0&count=100
async fn get_console(
    State(state): State<IPCServer>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let since_id = params.get("since").and_then(|s| s.parse::<u64>().ok());
    let count = params
        .get("count")
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(DEFAULT_CONSOLE_COUNT);

    let lines = match since_id {
        Some(id) => state.supervisor.console_since(id),
        None => state.supervisor.console_recent(count),
    };
    Json(json!({ "lines": lines }))
}

/// GET /api/local - record that survives launcher restarts
async fn get_local(State(state): State<IPCServer>) -> impl IntoResponse {
    match state.supervisor.local_record() {
        Ok(record) => Json(record).into_response(),
        Err(e) => e.into_response(),
    }
}
