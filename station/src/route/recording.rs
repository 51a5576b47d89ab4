use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use api::recording::RecordingState;
use api::request::{AddMarker, StartRecording, VersionQuery};
use api::response::{MarkerAdded, RecordingStarted, RecordingStopped};

use super::{AppState, Operator};
use crate::result::Result;

pub fn route() -> Router<AppState> {
    Router::new()
        .route(api::path::RECORDING_START, post(start))
        .route(api::path::RECORDING_STOP, post(stop))
        .route(api::path::RECORDING_MARKER, post(marker))
        .route(api::path::RECORDING_STATUS, get(status))
}

async fn start(
    State(state): State<AppState>,
    Operator(operator): Operator,
    Json(req): Json<StartRecording>,
) -> Result<Json<RecordingStarted>> {
    let started = state.recordings.start(&req.show_id).await?;
    info!(
        "[recording] {} started {}/{}",
        operator, started.show_id, started.version
    );
    Ok(Json(started))
}

async fn stop(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<RecordingStopped>> {
    Ok(Json(state.recordings.stop(&query.version).await?))
}

async fn marker(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
    Json(req): Json<AddMarker>,
) -> Result<Json<MarkerAdded>> {
    Ok(Json(
        state
            .recordings
            .add_marker(&query.version, req)
            .await?,
    ))
}

async fn status(State(state): State<AppState>) -> Json<RecordingState> {
    Json(state.recordings.status().await)
}
