//! `api` crate: the HTTP surface of the process engine.
//!
//! Exposes:
//!   POST   /definitions
//!   GET    /definitions?category=
//!   GET    /definitions/{name}?version=
//!   POST   /definitions/{id}/activate | deprecate | suspend
//!   POST   /processes/{name}/instances
//!   GET    /instances?status=
//!   GET    /instances/{id}
//!   GET    /instances/{id}/actions | notifications
//!   POST   /instances/{id}/cancel | suspend | resume
//!   GET    /tasks?assignee=&status=&instanceId=
//!   GET    /tasks/{id}
//!   POST   /tasks/{id}/actions | claim | comments
//!   GET    /health

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod handlers;

pub use error::ApiError;
pub use handlers::AppState;

use handlers::{definitions, instances, tasks};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/definitions", get(definitions::list).post(definitions::register))
        .route("/definitions/:definition", get(definitions::get))
        .route("/definitions/:definition/activate", post(definitions::activate))
        .route("/definitions/:definition/deprecate", post(definitions::deprecate))
        .route("/definitions/:definition/suspend", post(definitions::suspend))
        .route("/processes/:name/instances", post(instances::initiate))
        .route("/instances", get(instances::list))
        .route("/instances/:id", get(instances::get))
        .route("/instances/:id/actions", get(instances::actions))
        .route("/instances/:id/notifications", get(instances::notifications))
        .route("/instances/:id/cancel", post(instances::cancel))
        .route("/instances/:id/suspend", post(instances::suspend))
        .route("/instances/:id/resume", post(instances::resume))
        .route("/tasks", get(tasks::inbox))
        .route("/tasks/:id", get(tasks::get))
        .route("/tasks/:id/actions", post(tasks::execute_action))
        .route("/tasks/:id/claim", post(tasks::claim))
        .route("/tasks/:id/comments", post(tasks::comment))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http api listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
