use axum::{extract::State, response::Json};
use serde_json::{Value, json};

use crate::AppState;
use crate::errors::Result;

/// Liveness plus a snapshot of the queues.
#[tracing::instrument(skip_all)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<Value>> {
    let depths = state.queue.store().queue_depths().await?;
    let queues: serde_json::Map<String, Value> = depths
        .into_iter()
        .map(|(task, depth)| (task.to_string(), json!(depth)))
        .collect();
    Ok(Json(json!({ "status": "ok", "queues": queues })))
}
