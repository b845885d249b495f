//! Deployment HTTP routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::{IntoResponse, Json},
};
use serde::Serialize;

use super::{ApiError, ApiState};
use crate::deployment::{is_valid_name, Deployment, DeploymentId, DeploymentRequest};

#[derive(Serialize)]
pub struct DeploymentResponse {
    pub status: &'static str,
    pub deployment: Deployment,
}

#[derive(Serialize)]
pub struct DeploymentListResponse {
    pub status: &'static str,
    pub deployments: Vec<Deployment>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

fn ok(deployment: Deployment) -> Json<DeploymentResponse> {
    Json(DeploymentResponse {
        status: "ok",
        deployment,
    })
}

fn parse_id(raw: &str) -> Result<DeploymentId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid deployment id: {}", raw)))
}

fn validate(request: &DeploymentRequest) -> Result<(), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if !is_valid_name(&request.name) {
        return Err(ApiError::BadRequest(format!(
            "invalid name {:?}: must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
            request.name
        )));
    }
    if request.image.trim().is_empty() {
        return Err(ApiError::BadRequest("image must not be empty".to_string()));
    }
    Ok(())
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Json<DeploymentListResponse> {
    let mut deployments = state.store.list().await;
    deployments.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    Json(DeploymentListResponse {
        status: "ok",
        deployments,
    })
}

/// GET /deployment/:id
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let id = parse_id(&id)?;
    Ok(ok(state.store.get(&id).await?))
}

/// POST /deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let Json(request) = body?;
    validate(&request)?;

    Ok(ok(state.store.create(request).await))
}

/// PATCH /deployment/:id
///
/// Every field is replaced; the ID is kept.
pub async fn replace_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let id = parse_id(&id)?;
    let Json(request) = body?;
    validate(&request)?;

    Ok(ok(state.store.replace(&id, request).await?))
}

/// DELETE /deployment/:id
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.store.delete(&id).await?;

    Ok(Json(StatusResponse { status: "ok" }))
}
