use std::sync::Arc;

use axum::extract::FromRequestParts;
use http::request::Parts;
use storage::BlobStore;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::AppError;
use crate::event::StudioEvent;
use crate::finalize::Finalizer;
use crate::recording::{RecordingManager, VersionStore};
use crate::relay::Relay;
use crate::transfer::TransferManager;

pub mod recording;
pub mod recordings;
pub mod stream;
pub mod transfer;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: BlobStore,
    pub relay: Arc<Relay>,
    pub recordings: Arc<RecordingManager>,
    pub versions: Arc<VersionStore>,
    pub finalizer: Arc<Finalizer>,
    pub transfers: Arc<TransferManager>,
    pub events: broadcast::Sender<StudioEvent>,
}

/// Operator identity set by the auth layer
pub struct Operator(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<auth::claims::Claims>()
            .map(|claims| Operator(claims.sub.clone()))
            .ok_or_else(|| AppError::Forbidden("no operator identity".to_string()))
    }
}
