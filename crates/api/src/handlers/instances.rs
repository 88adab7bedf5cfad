use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use db::models::{BusinessObjectRef, InstanceStatus, Notification, ProcessInstance, TaskAction};
use engine::InitiateRequest;

use super::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateDto {
    pub business_object_type: String,
    pub business_object_id: String,
    #[serde(default)]
    pub business_object_name: Option<String>,
    pub initiator: String,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionDto {
    pub actor: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn initiate(
    State(state): State<AppState>,
    Path(process): Path<String>,
    Json(dto): Json<InitiateDto>,
) -> ApiResult<(StatusCode, Json<ProcessInstance>)> {
    let display_name = dto
        .business_object_name
        .unwrap_or_else(|| format!("{} {}", dto.business_object_type, dto.business_object_id));
    let request = InitiateRequest {
        business_object: BusinessObjectRef {
            object_type: dto.business_object_type,
            object_id: dto.business_object_id,
            display_name,
        },
        initiator: dto.initiator,
        variables: dto.variables,
    };
    let instance = state.engine.initiate(&process, request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ProcessInstance>>> {
    let status = match query.status.as_deref() {
        Some(text) => Some(
            InstanceStatus::from_name(text)
                .or_else(|| text.parse().ok())
                .ok_or_else(|| ApiError::BadRequest(format!("unknown instance status '{text}'")))?,
        ),
        None => None,
    };
    Ok(Json(state.engine.list_instances(status).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<ProcessInstance>> {
    Ok(Json(state.engine.get_instance(id).await?))
}

pub async fn actions(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<TaskAction>>> {
    Ok(Json(state.engine.list_actions(id).await?))
}

pub async fn notifications(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.engine.list_notifications(id).await?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(dto): Json<TransitionDto>,
) -> ApiResult<Json<ProcessInstance>> {
    Ok(Json(state.engine.cancel(id, &dto.actor, &dto.reason).await?))
}

pub async fn suspend(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(dto): Json<TransitionDto>,
) -> ApiResult<Json<ProcessInstance>> {
    Ok(Json(state.engine.suspend(id, &dto.actor, &dto.reason).await?))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(dto): Json<TransitionDto>,
) -> ApiResult<Json<ProcessInstance>> {
    Ok(Json(state.engine.resume(id, &dto.actor).await?))
}
