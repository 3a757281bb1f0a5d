//! REST endpoints for live-session administration.
//!
//! - `GET    /api/sessions`      — list live PTY sessions
//! - `DELETE /api/sessions/{id}` — shut down the session for a project

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/sessions` — list all live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let items = state.registry.list().await;
    Json(json!({ "sessions": items }))
}

/// `DELETE /api/sessions/{output_project_id}` — close the project's live
/// session and remove it from the registry. Any bound terminal observes this
/// as a `closed` frame.
pub async fn shutdown_session(
    State(state): State<AppState>,
    Path(output_project_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.registry.shutdown(&output_project_id).await {
        Ok(Json(json!({
            "ok": true,
            "output_project_id": output_project_id,
        })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("No live session for project {output_project_id}"),
                "code": "SESSION_NOT_FOUND",
            })),
        ))
    }
}
