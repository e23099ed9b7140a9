use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::instrument;

use crate::startup::AppState;

/// Re-reads the email templates from disk without a restart.
///
/// There is no authentication on this route. It only re-reads the configured
/// template directory, but any client that reaches the service can trigger it,
/// so deployments should keep `/admin/` behind the reverse proxy.
#[instrument(name = "Web: Reload templates", skip(state))]
pub async fn reload_templates(State(state): State<AppState>) -> impl IntoResponse {
    match state.notifier.reload().await {
        Ok(kinds) => {
            let names: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
            tracing::info!(templates = ?names, "Email templates reloaded");
            (StatusCode::OK, Json(json!({ "templates": names })))
        }
        Err(e) => {
            tracing::error!("Failed to reload templates: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to reload email templates" })),
            )
        }
    }
}
