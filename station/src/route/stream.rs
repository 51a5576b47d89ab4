use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use api::event::{ServerMessage, STOP_FRAME};
use api::request::StreamQuery;
use api::response::StreamStatus;

use super::{AppState, Operator};
use crate::error::AppError;
use crate::relay::SessionHandle;
use crate::result::Result;

pub fn route() -> Router<AppState> {
    Router::new()
        .route(api::path::STREAM_WS, get(socket))
        .route(api::path::STREAM_STATUS, get(status))
        .route(api::path::STREAM_STOP, post(stop))
}

async fn status(State(state): State<AppState>) -> Json<StreamStatus> {
    Json(state.relay.status())
}

async fn stop(State(state): State<AppState>, Operator(by): Operator) -> Result<Json<StreamStatus>> {
    let operator = state.relay.stop(&by).await?;
    info!("[stream] {} stopped the stream of {}", by, operator);
    Ok(Json(state.relay.status()))
}

async fn socket(
    State(state): State<AppState>,
    Operator(operator): Operator,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    // refuse a busy stream with a plain 409 instead of a socket
    state.relay.check(&operator, query.force)?;
    Ok(ws.on_upgrade(move |socket| serve(state, operator, query.force, socket)))
}

async fn push(tx: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => tx.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!("[stream] encode {:?}: {}", msg, e);
            false
        }
    }
}

/// Why the socket loop ended
enum End {
    /// Someone else closed the session
    Kicked,
    /// Our side is done, the session still has to be closed
    Closed,
}

async fn serve(state: AppState, operator: String, force: bool, socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    let opened = match state.relay.open(&operator, force).await {
        Ok(opened) => opened,
        Err(e) => {
            push(&mut tx, &ServerMessage::Error {
                message: e.to_string(),
            })
            .await;
            let _ = tx.close().await;
            return;
        }
    };
    let handle: SessionHandle = opened.handle;
    let mut disconnected = opened.disconnected;
    let mut events = state.events.subscribe();

    let connected = ServerMessage::Connected {
        session_id: handle.id.to_string(),
        operator: operator.clone(),
        replaced: opened.replaced.is_some(),
    };
    let end = if !push(&mut tx, &connected).await {
        End::Closed
    } else {
        loop {
            tokio::select! {
                reason = &mut disconnected => {
                    if let Ok(reason) = reason {
                        push(&mut tx, &ServerMessage::Disconnected { reason }).await;
                    }
                    break End::Kicked;
                }
                msg = rx.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        match state.relay.send(&handle, &bytes).await {
                            Ok(()) => {}
                            Err(AppError::SessionClosed) => break End::Kicked,
                            Err(e) => {
                                warn!("[stream] {} sent a bad stream: {}", operator, e);
                                push(&mut tx, &ServerMessage::Error { message: e.to_string() }).await;
                                break End::Closed;
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) if text.as_str().trim() == STOP_FRAME => {
                        debug!("[stream] {} asked to stop", operator);
                        break End::Closed;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break End::Closed,
                    Some(Ok(_)) => {}
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(msg) = event.to_message() {
                            if !push(&mut tx, &msg).await {
                                break End::Closed;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => debug!("[stream] socket skipped {} events", n),
                    Err(RecvError::Closed) => break End::Closed,
                },
            }
        }
    };

    if let End::Closed = end {
        if let Err(e) = state.relay.close(&handle).await {
            debug!("[stream] close {}: {}", handle.id, e);
        }
    }
    let _ = tx.close().await;
    info!("[stream] socket of {} ended", operator);
}
