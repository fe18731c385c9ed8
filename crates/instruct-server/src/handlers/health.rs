//! Health check handler.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Handle health check requests. Includes scheduler utilization.
pub async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "backend": state.backend.kind().tag(),
        "model": state.config.hf_model_name,
        "tasks": {
            "executing": state.queue.executing(),
            "waiting": state.queue.waiting(),
            "limit": state.queue.limit(),
            "registered": state.cancellations.len(),
        },
        "conversations": state.conversations.len(),
    }))
}
