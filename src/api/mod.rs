//! HTTP API for managing deployments
//!
//! Handlers only touch the store. Every successful mutation wakes the
//! reconcile loop through the store's subscriber, so the API never talks to
//! the container runtime directly.

pub mod error;
pub mod routes;

use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::deployment::DeploymentStore;

pub use error::ApiError;

/// State shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DeploymentStore>,
}

/// Create the API router
pub fn create_router(store: Arc<DeploymentStore>) -> Router {
    Router::new()
        .route(
            "/deployments",
            get(routes::list_deployments).post(routes::create_deployment),
        )
        .route(
            "/deployment/:id",
            get(routes::get_deployment)
                .patch(routes::replace_deployment)
                .delete(routes::delete_deployment),
        )
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { store })
}
