use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use engine::{DefinitionSpec, ProcessDefinition};

use super::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<i32>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(spec): Json<DefinitionSpec>,
) -> ApiResult<(StatusCode, Json<ProcessDefinition>)> {
    let definition = state.engine.registry().register(spec).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ProcessDefinition>>> {
    let definitions = state.engine.registry().list(query.category.as_deref()).await?;
    Ok(Json(definitions))
}

/// `name` is the process name; the latest active version unless `?version=`.
pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<ProcessDefinition>> {
    Ok(Json(state.engine.registry().get(&name, query.version).await?))
}

pub async fn activate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    Ok(Json(state.engine.registry().activate(id).await?))
}

pub async fn deprecate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    Ok(Json(state.engine.registry().deprecate(id).await?))
}

pub async fn suspend(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ProcessDefinition>> {
    Ok(Json(state.engine.registry().suspend(id).await?))
}
