use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware;
use axum::Router;
use storage::BlobStore;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::{error, info, info_span, warn, Level};

use auth::{access::access_middleware, ManyValidate};

use crate::catalog::{Catalog, StaticCatalog};
use crate::config::Config;
use crate::finalize::Finalizer;
use crate::recording::{RecordingManager, VersionStore};
use crate::relay::Relay;
use crate::route::AppState;
use crate::transfer::TransferManager;

pub mod audio;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod finalize;
mod r#macro;
pub mod recording;
pub mod relay;
pub mod result;
mod route;
pub mod transfer;

const EVENT_CAPACITY: usize = 256;
/// How often idle transfer sessions are looked for
const TRANSFER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Wire every component together, serve until `signal` resolves, then
/// close the recording and the stream.
pub async fn serve<F>(cfg: Config, listener: TcpListener, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = BlobStore::from_config(&cfg.storage).await?;
    let events = new_broadcast_channel!(EVENT_CAPACITY);
    let catalog: Arc<dyn Catalog> = Arc::new(StaticCatalog::from_config(&cfg.catalog));
    let versions = Arc::new(VersionStore::new(
        store.clone(),
        Duration::from_secs(cfg.finalize.download_url_ttl_secs),
    ));
    let relay = Arc::new(Relay::new(relay::sink::from_config(&cfg.sink), events.clone()));
    let recordings = RecordingManager::new(
        relay.clone(),
        versions.clone(),
        catalog.clone(),
        cfg.recording.clone(),
        events.clone(),
    );
    let finalizer = Arc::new(Finalizer::new(
        store.clone(),
        versions.clone(),
        cfg.finalize.clone(),
    ));
    let transfers = Arc::new(TransferManager::new(
        store.clone(),
        versions.clone(),
        catalog,
        cfg.transfer.clone(),
    ));
    transfers.spawn_sweeper(TRANSFER_SWEEP_INTERVAL);

    match recordings.recover().await {
        Ok(0) => {}
        Ok(n) => warn!("[recording] {} interrupted recordings marked for inspection", n),
        Err(e) => error!("[recording] recovery failed: {}", e),
    }
    if cfg.finalize.resume_on_startup {
        match finalizer.resume_interrupted().await {
            Ok(0) => {}
            Ok(n) => info!("[finalize] resumed {} interrupted jobs", n),
            Err(e) => error!("[finalize] resume failed: {}", e),
        }
    }

    let app_state = AppState {
        config: cfg.clone(),
        store,
        relay: relay.clone(),
        recordings: recordings.clone(),
        versions,
        finalizer,
        transfers,
        events,
    };
    let auth_layer = ValidateRequestHeaderLayer::custom(ManyValidate::new(
        cfg.auth.secret.clone(),
        cfg.auth.operators.clone(),
    ));
    let app = Router::new()
        .merge(
            route::stream::route()
                .merge(route::recording::route())
                .merge(route::recordings::route())
                .merge(route::transfer::route(
                    cfg.transfer.max_chunk_bytes,
                    cfg.transfer.single_request_limit_bytes,
                ))
                .layer(middleware::from_fn(access_middleware))
                .layer(auth_layer),
        )
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(cfg.http.max_body_bytes))
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let span = info_span!(
                        "http_request",
                        uri = ?request.uri(),
                        method = ?request.method(),
                        span_id = tracing::field::Empty,
                    );
                    span.record(
                        "span_id",
                        span.id().unwrap_or(tracing::Id::from_u64(42)).into_u64(),
                    );
                    span
                })
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO))
                .on_failure(tower_http::trace::DefaultOnFailure::new().level(Level::INFO)),
        );

    info!("[server] listening on {}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await;
    if let Err(e) = &served {
        error!("Application error: {e}");
    }

    recordings.shutdown().await;
    relay.shutdown().await;
    info!("[server] stopped");
    served.map_err(Into::into)
}
