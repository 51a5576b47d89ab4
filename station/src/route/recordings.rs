use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::SinkExt;
use http::{header, HeaderMap, StatusCode};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use api::event::FinalizeProgress;
use api::recording::{RecordingVersionInfo, VersionStatus};
use api::request::FinalizeQuery;

use super::AppState;
use crate::error::AppError;
use crate::finalize::Subscription;
use crate::result::Result;

/// Bytes per storage read while serving a download
const DOWNLOAD_PIECE: u64 = 1024 * 1024;

pub fn route() -> Router<AppState> {
    Router::new()
        .route(&api::path::show_recordings("{show_id}"), get(index))
        .route(&api::path::recording("{show_id}", "{version}"), get(info))
        .route(
            &api::path::recording_download("{show_id}", "{version}"),
            get(download),
        )
        .route(&api::path::finalize("{show_id}", "{version}"), post(finalize))
        .route(
            &api::path::finalize_ws("{show_id}", "{version}"),
            get(finalize_socket),
        )
}

async fn index(
    State(state): State<AppState>,
    Path(show_id): Path<String>,
) -> Result<Json<Vec<RecordingVersionInfo>>> {
    let mut out = Vec::new();
    for record in state.versions.list(&show_id).await? {
        out.push(state.versions.info(&record).await);
    }
    Ok(Json(out))
}

async fn info(
    State(state): State<AppState>,
    Path((show_id, version)): Path<(String, String)>,
) -> Result<Json<RecordingVersionInfo>> {
    let record = state.versions.get(&show_id, &version).await?;
    Ok(Json(state.versions.info(&record).await))
}

/// `bytes=a-b`, `bytes=a-` and `bytes=-n`, resolved against `size`
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    // multiple ranges are answered with the first one
    let spec = spec.split(',').next()?.trim();
    let (start, end) = spec.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", "") => return None,
        ("", n) => {
            let n: u64 = n.parse().ok()?;
            if n == 0 {
                return None;
            }
            (size.saturating_sub(n), size.checked_sub(1)?)
        }
        (a, "") => (a.parse().ok()?, size.checked_sub(1)?),
        (a, b) => {
            let b: u64 = b.parse().ok()?;
            (a.parse().ok()?, b.min(size.checked_sub(1)?))
        }
    };
    if start > end || start >= size {
        return None;
    }
    Some((start, end))
}

async fn download(
    State(state): State<AppState>,
    Path((show_id, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let record = state.versions.get(&show_id, &version).await?;
    if record.status != VersionStatus::Finalized {
        return Err(AppError::not_found(format!(
            "{}/{} is {}, nothing to download",
            show_id, version, record.status
        )));
    }
    let key = record.final_key;
    let size = state
        .store
        .stat(&key)
        .await
        .map_err(AppError::storage)?
        .ok_or_else(|| AppError::not_found(format!("{} is missing", key)))?;

    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, size));
    let (status, start, end) = match requested {
        None => (StatusCode::OK, 0, size.saturating_sub(1)),
        Some(Some((start, end))) => (StatusCode::PARTIAL_CONTENT, start, end),
        Some(None) => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
            )
                .into_response())
        }
    };
    let length = if size == 0 { 0 } else { end - start + 1 };
    debug!("[recordings] serving {} bytes {}-{}", key, start, end);

    let store = state.store.clone();
    let body = async_stream::stream! {
        let mut offset = start;
        let stop = start + length;
        while offset < stop {
            let len = DOWNLOAD_PIECE.min(stop - offset);
            match store.range_get(&key, offset, len).await {
                Ok(bytes) if !bytes.is_empty() => {
                    offset += bytes.len() as u64;
                    yield Ok::<_, std::io::Error>(bytes);
                }
                Ok(_) => {
                    yield Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} ended at {}", key, offset),
                    ));
                    break;
                }
                Err(e) => {
                    warn!("[recordings] download of {} broke at {}: {:#}", key, offset, e);
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "audio/wav")
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}-{}.wav\"", show_id, version),
        );
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, size),
        );
    }
    Ok(builder.body(Body::from_stream(body))?)
}

/// Start finalizing or attach to the running job
async fn finalize(
    State(state): State<AppState>,
    Path((show_id, version)): Path<(String, String)>,
) -> Result<(StatusCode, Json<FinalizeProgress>)> {
    let sub = state.finalizer.finalize(&show_id, &version).await?;
    Ok((StatusCode::ACCEPTED, Json(sub.snapshot)))
}

async fn finalize_socket(
    State(state): State<AppState>,
    Path((show_id, version)): Path<(String, String)>,
    Query(query): Query<FinalizeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let sub = if query.watch {
        state.finalizer.subscribe(&show_id, &version).await?
    } else {
        state.finalizer.finalize(&show_id, &version).await?
    };
    Ok(ws.on_upgrade(move |socket| follow(sub, socket)))
}

async fn push(socket: &mut WebSocket, progress: &FinalizeProgress) -> bool {
    match serde_json::to_string(progress) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// Catch-up snapshot, then live progress until a terminal event
async fn follow(mut sub: Subscription, mut socket: WebSocket) {
    let snapshot = sub.snapshot.clone();
    let feed = sub.rx.take();
    if let (true, false, Some(mut feed)) = (
        push(&mut socket, &snapshot).await,
        snapshot.is_terminal(),
        feed,
    ) {
        loop {
            let progress = tokio::select! {
                event = feed.recv() => match event {
                    Ok(progress) => progress,
                    Err(RecvError::Lagged(n)) => {
                        debug!("[finalize] subscriber lagged by {}, catching up", n);
                        sub.latest()
                    }
                    Err(RecvError::Closed) => {
                        push(&mut socket, &sub.latest()).await;
                        break;
                    }
                },
                // the client went away, the job keeps going
                msg = socket.recv() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                },
            };
            if !push(&mut socket, &progress).await || progress.is_terminal() {
                break;
            }
        }
    }
    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=900-", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=990-2000", 1000), Some((990, 999)));
        assert_eq!(parse_range("bytes=0-9, 20-29", 1000), Some((0, 9)));
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=50-10", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
        assert_eq!(parse_range("bytes=0-0", 0), None);
    }
}
