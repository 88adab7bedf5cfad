use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use db::models::{TaskFilter, TaskStatus, WorkflowTask};
use engine::{ActionRequest, ActionResult};

use super::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxQuery {
    pub assignee: Option<String>,
    pub status: Option<String>,
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimDto {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentDto {
    pub author: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

pub async fn inbox(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
) -> ApiResult<Json<Vec<WorkflowTask>>> {
    let status = match query.status.as_deref() {
        Some(text) => Some(
            TaskStatus::from_name(text)
                .or_else(|| text.parse().ok())
                .ok_or_else(|| ApiError::BadRequest(format!("unknown task status '{text}'")))?,
        ),
        None => None,
    };
    let filter = TaskFilter {
        assignee: query.assignee,
        status,
        instance_id: query.instance_id,
    };
    Ok(Json(state.engine.list_tasks(&filter).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<WorkflowTask>> {
    Ok(Json(state.engine.get_task(id).await?))
}

pub async fn execute_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Json<ActionResult>> {
    Ok(Json(state.engine.execute_action(id, request).await?))
}

pub async fn claim(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(dto): Json<ClaimDto>,
) -> ApiResult<Json<WorkflowTask>> {
    Ok(Json(state.engine.claim_task(id, &dto.actor).await?))
}

pub async fn comment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(dto): Json<CommentDto>,
) -> ApiResult<Json<WorkflowTask>> {
    let task = state
        .engine
        .comment_task(id, &dto.author, &dto.text, dto.attachments)
        .await?;
    Ok(Json(task))
}
