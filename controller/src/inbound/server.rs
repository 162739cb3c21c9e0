use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::{error, info};
use serde::Deserialize;
use stevedore_shared::{Container, ContainerAccepted, Heartbeat, Node, NodeState};

use crate::domain::ports::{Store, StoreError};

/// The control API is deliberately thin: handlers are transport for the
/// reconcilers and the CLI, not a second place where lifecycle rules live.
/// The only policy applied here is the field-ownership merge — a user upsert
/// cannot move observed fields, a worker report cannot move placement.
#[derive(Clone)]
pub struct AppState<S: Store> {
    pub store: S,
}

pub fn create_app<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/nodes/register", post(register_node))
        .route("/nodes/heartbeat", post(heartbeat))
        .route("/nodes", get(list_nodes))
        .route("/containers/assigned", get(assigned_containers))
        .route("/containers/status", post(report_status))
        .route("/containers", post(add_container).get(list_containers))
        .route(
            "/containers/{id}",
            get(get_container).delete(delete_container),
        )
        .with_state(state)
}

fn store_failure(e: StoreError) -> StatusCode {
    error!("Store failure: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn register_node<S: Store>(
    State(state): State<AppState<S>>,
    payload: Result<Json<Node>, JsonRejection>,
) -> Result<StatusCode, StatusCode> {
    let Json(mut node) = payload.map_err(|_| StatusCode::BAD_REQUEST)?;
    node.state = NodeState::Ready;
    node.last_seen = Utc::now();
    if let Ok(existing) = state.store.get_node(&node.id).await {
        node.created_at = existing.created_at;
    }
    state.store.save_node(&node).await.map_err(store_failure)?;
    info!("Node registered: {} at {}", node.id, node.address);
    Ok(StatusCode::OK)
}

async fn heartbeat<S: Store>(
    State(state): State<AppState<S>>,
    payload: Result<Json<Heartbeat>, JsonRejection>,
) -> Result<StatusCode, StatusCode> {
    let Json(beat) = payload.map_err(|_| StatusCode::BAD_REQUEST)?;
    let mut node = match state.store.get_node(&beat.node_id).await {
        Ok(node) => node,
        Err(StoreError::NotFound) => return Err(StatusCode::NOT_FOUND),
        Err(e) => return Err(store_failure(e)),
    };
    node.last_seen = Utc::now();
    state.store.save_node(&node).await.map_err(store_failure)?;
    Ok(StatusCode::OK)
}

async fn list_nodes<S: Store>(
    State(state): State<AppState<S>>,
) -> Result<Json<Vec<Node>>, StatusCode> {
    let nodes = state.store.list_nodes().await.map_err(store_failure)?;
    Ok(Json(nodes))
}

#[derive(Deserialize)]
struct AssignedQuery {
    node_id: String,
}

async fn assigned_containers<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<AssignedQuery>,
) -> Result<Json<Vec<Container>>, StatusCode> {
    let containers = state.store.list_containers().await.map_err(store_failure)?;
    let assigned = containers
        .into_iter()
        .filter(|c| c.scheduled && c.node_id == query.node_id)
        .collect();
    Ok(Json(assigned))
}

async fn add_container<S: Store>(
    State(state): State<AppState<S>>,
    payload: Result<Json<Container>, JsonRejection>,
) -> Result<Json<ContainerAccepted>, StatusCode> {
    let Json(incoming) = payload.map_err(|_| StatusCode::BAD_REQUEST)?;
    let record = match state.store.get_container(&incoming.id).await {
        Ok(mut existing) => {
            existing.apply_intent(&incoming);
            existing
        }
        Err(StoreError::NotFound) => incoming,
        Err(e) => return Err(store_failure(e)),
    };
    state
        .store
        .save_container(&record)
        .await
        .map_err(store_failure)?;
    info!("Container upserted: {} ({})", record.id, record.image);
    Ok(Json(ContainerAccepted {
        id: record.id,
        status: "scheduled".to_string(),
    }))
}

async fn report_status<S: Store>(
    State(state): State<AppState<S>>,
    payload: Result<Json<Container>, JsonRejection>,
) -> Result<StatusCode, StatusCode> {
    let Json(report) = payload.map_err(|_| StatusCode::BAD_REQUEST)?;
    let mut record = match state.store.get_container(&report.id).await {
        Ok(existing) => existing,
        Err(StoreError::NotFound) => return Err(StatusCode::NOT_FOUND),
        Err(e) => return Err(store_failure(e)),
    };
    record.apply_report(&report);
    state
        .store
        .save_container(&record)
        .await
        .map_err(store_failure)?;
    info!("Container status updated: {} -> {}", record.id, record.state);
    Ok(StatusCode::OK)
}

async fn list_containers<S: Store>(
    State(state): State<AppState<S>>,
) -> Result<Json<Vec<Container>>, StatusCode> {
    let containers = state.store.list_containers().await.map_err(store_failure)?;
    Ok(Json(containers))
}

async fn get_container<S: Store>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<Container>, StatusCode> {
    match state.store.get_container(&id).await {
        Ok(container) => Ok(Json(container)),
        Err(StoreError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(store_failure(e)),
    }
}

async fn delete_container<S: Store>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .store
        .delete_container(&id)
        .await
        .map_err(store_failure)?;
    info!("Container deleted: {id}");
    Ok(StatusCode::OK)
}
