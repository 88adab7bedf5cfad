//! Request handlers, one module per resource.

use std::sync::Arc;

use axum::Json;
use serde_json::{json, Value};

use engine::ProcessEngine;

pub mod definitions;
pub mod instances;
pub mod tasks;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProcessEngine>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
