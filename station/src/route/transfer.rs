use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::routing::{post, put};
use axum::{Json, Router};
use http::StatusCode;

use api::request::{TransferInit, TransferMetadata, SINGLE_FILE_FIELD, SINGLE_METADATA_FIELD};
use api::response::{ChunkAccepted, TransferComplete, TransferSession};

use super::{AppState, Operator};
use crate::error::AppError;
use crate::result::Result;

/// Multipart framing on top of the single request payload
const MULTIPART_SLACK: usize = 64 * 1024;

pub fn route(max_chunk_bytes: u64, single_request_limit_bytes: u64) -> Router<AppState> {
    let chunk_limit = usize::try_from(max_chunk_bytes).unwrap_or(usize::MAX);
    let single_limit = usize::try_from(single_request_limit_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_SLACK);
    Router::new()
        .route(api::path::TRANSFER_INIT, post(init))
        .route(
            &api::path::transfer_chunk("{session_id}", "{index}"),
            put(chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route(
            &api::path::transfer_finalize("{session_id}"),
            post(finalize),
        )
        .route(
            api::path::TRANSFER_SINGLE,
            post(single).layer(DefaultBodyLimit::max(single_limit)),
        )
}

async fn init(
    State(state): State<AppState>,
    Operator(operator): Operator,
    Json(req): Json<TransferInit>,
) -> Result<(StatusCode, Json<TransferSession>)> {
    let session = state.transfers.init(&operator, req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn chunk(
    State(state): State<AppState>,
    Operator(operator): Operator,
    Path((session_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Result<Json<ChunkAccepted>> {
    Ok(Json(
        state
            .transfers
            .chunk(&operator, &session_id, index, body.to_vec())
            .await?,
    ))
}

async fn finalize(
    State(state): State<AppState>,
    Operator(operator): Operator,
    Path(session_id): Path<String>,
) -> Result<Json<TransferComplete>> {
    Ok(Json(
        state
            .transfers
            .finalize_upload(&operator, &session_id)
            .await?,
    ))
}

/// `metadata` JSON part followed by the `file` part
async fn single(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TransferComplete>> {
    let mut metadata: Option<TransferMetadata> = None;
    let mut data: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.body_text()))?
    {
        match field.name() {
            Some(SINGLE_METADATA_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.body_text()))?;
                metadata = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| AppError::bad_request(format!("metadata: {}", e)))?,
                );
            }
            Some(SINGLE_FILE_FIELD) => {
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::bad_request(e.body_text()))?,
                );
            }
            _ => {}
        }
    }
    let metadata = metadata.ok_or_else(|| AppError::bad_request("missing metadata part"))?;
    let data = data.ok_or_else(|| AppError::bad_request("missing file part"))?;
    Ok(Json(state.transfers.single(metadata, data.to_vec()).await?))
}
