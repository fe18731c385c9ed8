//! Out-of-band abort handler.

use axum::{extract::State, http::StatusCode, Json};
use instruct_scheduler::TaskId;

use crate::{
    error::ServerError,
    models::{AbortRequest, AbortResponse},
    state::AppState,
};

/// Flag a task for cancellation. Fire-and-forget: unknown or finished tasks
/// are accepted with `signaled: false`.
pub async fn handle_abort(
    State(state): State<AppState>,
    Json(req): Json<AbortRequest>,
) -> Result<(StatusCode, Json<AbortResponse>), ServerError> {
    let task_id: TaskId = req
        .task_id
        .parse()
        .map_err(|_| ServerError::InvalidRequest(format!("`{}` is not a task id", req.task_id)))?;

    let signaled = state.abort(task_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            task_id: task_id.to_string(),
            signaled,
        }),
    ))
}
