// ABOUTME: HTTP JSON endpoints for workspace file operations and service status
// Thin handlers over the file service; error kinds map onto status codes here

use super::AppState;
use crate::files::FileError;
use crate::workspace::WorkspaceError;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SaveFileRequest {
    #[serde(default, alias = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(default, alias = "fileName")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default, alias = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(default, alias = "fileName")]
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceSummary {
    pub id: String,
    pub container_name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub sessions: usize,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidName(_) | FileError::Workspace(WorkspaceError::InvalidId(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            FileError::NotFound(_) => ApiError::NotFound(err.to_string()),
            FileError::Workspace(WorkspaceError::Environment(_)) | FileError::Environment(_) => {
                error!("File operation failed: {}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/files/save", post(save_file))
        .route("/api/files/load", get(load_file))
        .route("/api/files/list", get(list_files))
        .route("/api/workspaces", get(list_workspaces))
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn save_file(
    State(state): State<AppState>,
    Json(req): Json<SaveFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(file_name), Some(content)) = (req.file_name, req.content) else {
        return Err(ApiError::BadRequest("Missing required fields".to_string()));
    };

    let services = &state.services;
    let workspace_id = services.workspace_or_default(req.workspace_id.as_deref());
    services.files.save(workspace_id, &file_name, &content).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("File {file_name} saved successfully"),
    })))
}

async fn load_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(file_name) = query.file_name else {
        return Err(ApiError::BadRequest("Missing fileName".to_string()));
    };

    let services = &state.services;
    let workspace_id = services.workspace_or_default(query.workspace_id.as_deref());
    let content = services.files.load(workspace_id, &file_name).await?;

    Ok(Json(json!({
        "success": true,
        "content": content,
        "file_name": file_name,
    })))
}

async fn list_files(State(state): State<AppState>, Query(query): Query<FileQuery>) -> impl IntoResponse {
    let services = &state.services;
    let workspace_id = services.workspace_or_default(query.workspace_id.as_deref());
    let files = services.files.list(workspace_id).await;

    Json(json!({ "success": true, "files": files }))
}

async fn list_workspaces(State(state): State<AppState>) -> impl IntoResponse {
    let services = &state.services;
    let mut workspaces = Vec::new();
    for workspace in services.registry.list().await {
        workspaces.push(WorkspaceSummary {
            id: workspace.id.clone(),
            container_name: workspace.handle.container_name.clone(),
            created_at: workspace.created_at,
            sessions: services.sessions.count_for(&workspace.id).await,
        });
    }

    Json(json!({ "workspaces": workspaces }))
}
