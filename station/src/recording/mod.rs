//! Recording sessions and their marker timeline.
//!
//! At most one recording runs at a time. It is tied to the live stream
//! through the relay's raw tap.

use std::sync::{Arc, Weak};

use api::recording::{self, Marker, RecordingState, VersionStatus};
use api::request::AddMarker;
use api::response::{MarkerAdded, RecordingStarted, RecordingStopped};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{ensure_show, validate_marker, Catalog};
use crate::config::RecordingConfig;
use crate::error::AppError;
use crate::event::StudioEvent;
use crate::relay::{RawTap, Relay, TapSummary};
use crate::result::Result;

pub mod budget;
pub mod version;

use budget::BudgetStep;
pub use version::{VersionRecord, VersionStore};

struct Active {
    show_id: String,
    version: String,
    raw_key: String,
    started_at: DateTime<Utc>,
    started: Instant,
    markers: Vec<Marker>,
    budget: CancellationToken,
}

impl Active {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn matches(&self, version: &str) -> bool {
        self.version == version
    }
}

/// A session whose tap is already detached from the relay
struct Closed {
    active: Active,
    elapsed_ms: u64,
    summary: Option<TapSummary>,
}

pub struct RecordingManager {
    relay: Arc<Relay>,
    versions: Arc<VersionStore>,
    catalog: Arc<dyn Catalog>,
    config: RecordingConfig,
    events: broadcast::Sender<StudioEvent>,
    active: Mutex<Option<Active>>,
}

impl RecordingManager {
    pub fn new(
        relay: Arc<Relay>,
        versions: Arc<VersionStore>,
        catalog: Arc<dyn Catalog>,
        config: RecordingConfig,
        events: broadcast::Sender<StudioEvent>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            relay,
            versions,
            catalog,
            config,
            events: events.clone(),
            active: Mutex::new(None),
        });
        tokio::spawn(Self::watch_tap(Arc::downgrade(&manager), events.subscribe()));
        manager
    }

    fn emit(&self, event: StudioEvent) {
        let _ = self.events.send(event);
    }

    /// Begin recording the live stream for `show_id`
    pub async fn start(self: &Arc<Self>, show_id: &str) -> Result<RecordingStarted> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(AppError::AlreadyRecording(current.version.clone()));
        }
        ensure_show(self.catalog.as_ref(), show_id).await?;
        if !self.relay.is_live() {
            return Err(AppError::NotLive);
        }

        let (version, started_at) = self.versions.mint();
        let record = VersionRecord::new(
            show_id,
            &version,
            VersionStatus::Recording,
            started_at.timestamp_millis(),
        );
        self.versions.create(&record).await?;
        self.versions.save_markers(show_id, &version, &[]).await?;

        let tap = RawTap::new(
            self.versions.store().clone(),
            show_id.to_string(),
            version.clone(),
            record.raw_key.clone(),
        );
        if let Err(e) = self.relay.begin_tap(tap).await {
            error!("[recording] {}/{} could not start: {}", show_id, version, e);
            let message = e.to_string();
            let _ = self
                .versions
                .transition(show_id, &version, VersionStatus::Failed, |r| {
                    r.error_message = Some(message);
                })
                .await;
            return Err(e);
        }

        let token = CancellationToken::new();
        let started = Instant::now();
        *active = Some(Active {
            show_id: show_id.to_string(),
            version: version.clone(),
            raw_key: record.raw_key.clone(),
            started_at,
            started,
            markers: Vec::new(),
            budget: token.clone(),
        });
        drop(active);

        tokio::spawn(Self::run_budget(
            Arc::downgrade(self),
            version.clone(),
            started,
            token,
        ));
        info!("[recording] started {}/{}", show_id, version);
        self.emit(StudioEvent::RecordingStarted {
            show_id: show_id.to_string(),
            version: version.clone(),
        });
        Ok(RecordingStarted {
            show_id: show_id.to_string(),
            version,
            raw_key: record.raw_key,
        })
    }

    /// Append a marker. Offsets are relative to recording start and never negative.
    pub async fn add_marker(&self, version: &str, req: AddMarker) -> Result<MarkerAdded> {
        let mut guard = self.active.lock().await;
        let active = match guard.as_mut() {
            Some(active) if active.matches(version) => active,
            _ => return Err(AppError::NotRecording),
        };
        validate_marker(
            self.catalog.as_ref(),
            &active.show_id,
            &req.artist_id,
            &req.track_key,
        )
        .await?;

        // past the budget only while the session itself overruns it
        let limit_ms = (self.config.budget().as_millis() as u64).max(active.elapsed_ms());
        let offset_ms = match req.offset_ms {
            Some(offset) => offset.max(0) as u64,
            None => active.elapsed_ms(),
        };
        if offset_ms > limit_ms {
            return Err(AppError::bad_request(format!(
                "marker offset {}ms is past the recording budget of {}ms",
                offset_ms, limit_ms
            )));
        }
        active.markers.push(Marker {
            artist_id: req.artist_id,
            track_type: req.track_type,
            track_key: req.track_key,
            duration_ms: req.duration_ms.min(limit_ms),
            offset_ms,
        });
        let index = active.markers.len() - 1;
        if let Err(e) = self
            .versions
            .save_markers(&active.show_id, &active.version, &active.markers)
            .await
        {
            warn!(
                "[recording] persist markers of {} failed: {}",
                active.version, e
            );
        }
        Ok(MarkerAdded {
            index,
            offset_ms,
            marker_count: active.markers.len(),
        })
    }

    /// Close the raw capture and freeze the timeline
    pub async fn stop(&self, version: &str) -> Result<RecordingStopped> {
        let closed = {
            let mut guard = self.active.lock().await;
            match guard.take() {
                Some(active) if active.matches(version) => self.close(active).await,
                other => {
                    *guard = other;
                    return Err(AppError::NotRecording);
                }
            }
        };
        self.finish(closed, None).await
    }

    /// Detach the tap. Callers hold the session lock, so a new start
    /// never finds the old tap still attached.
    async fn close(&self, active: Active) -> Closed {
        active.budget.cancel();
        let elapsed_ms = active.elapsed_ms();
        let summary = self.relay.end_tap(&active.version).await;
        Closed {
            active,
            elapsed_ms,
            summary,
        }
    }

    async fn finish(&self, closed: Closed, failure: Option<String>) -> Result<RecordingStopped> {
        let Closed {
            mut active,
            elapsed_ms,
            summary,
        } = closed;

        let mut failure = failure;
        let mut duration_ms = elapsed_ms;
        match summary {
            Some(summary) => {
                if failure.is_none() {
                    failure = summary.failure.clone();
                }
                if summary.format.is_none() && failure.is_none() {
                    failure = Some("no audio was captured".to_string());
                }
                if summary.format.is_some() {
                    duration_ms = summary.duration_ms();
                }
            }
            None => {
                if failure.is_none() {
                    failure = Some("raw capture closed early".to_string());
                }
            }
        }

        let added = active.markers.len();
        if recording::keep_within(&mut active.markers, duration_ms) < added {
            warn!(
                "[recording] {} drops {} markers past the end of the capture",
                active.version,
                added - active.markers.len()
            );
        }
        if let Err(e) = self
            .versions
            .save_markers(&active.show_id, &active.version, &active.markers)
            .await
        {
            error!("[recording] final markers of {} lost: {}", active.version, e);
            if failure.is_none() {
                failure = Some(e.to_string());
            }
        }

        let marker_count = active.markers.len();
        let status = if failure.is_some() {
            VersionStatus::Failed
        } else {
            VersionStatus::Raw
        };
        let message = failure.clone();
        self.versions
            .transition(&active.show_id, &active.version, status, |r| {
                r.duration_ms = duration_ms;
                r.marker_count = marker_count;
                if message.is_some() {
                    r.needs_inspection = true;
                    r.error_message = message;
                }
            })
            .await?;

        match failure {
            Some(message) => {
                error!(
                    "[recording] {}/{} failed: {}",
                    active.show_id, active.version, message
                );
                self.emit(StudioEvent::RecordingFailed {
                    show_id: active.show_id.clone(),
                    version: active.version.clone(),
                    message,
                });
            }
            None => {
                info!(
                    "[recording] stopped {}/{} after {}ms, {} markers",
                    active.show_id, active.version, duration_ms, marker_count
                );
                self.emit(StudioEvent::RecordingStopped {
                    show_id: active.show_id.clone(),
                    version: active.version.clone(),
                    status,
                });
            }
        }

        Ok(RecordingStopped {
            show_id: active.show_id,
            version: active.version,
            raw_key: active.raw_key,
            status,
            duration_ms,
            marker_count,
        })
    }

    pub async fn status(&self) -> RecordingState {
        let budget_ms = self.config.budget().as_millis() as u64;
        match self.active.lock().await.as_ref() {
            Some(active) => {
                let elapsed_ms = active.elapsed_ms();
                RecordingState {
                    is_recording: true,
                    show_id: Some(active.show_id.clone()),
                    version: Some(active.version.clone()),
                    started_at: Some(active.started_at.timestamp_millis()),
                    elapsed_ms,
                    marker_count: active.markers.len(),
                    budget_ms,
                    remaining_ms: Some(budget_ms.saturating_sub(elapsed_ms)),
                }
            }
            None => RecordingState {
                budget_ms,
                ..Default::default()
            },
        }
    }

    /// Stop whatever is recording, used on shutdown
    pub async fn shutdown(&self) {
        let closed = {
            let mut guard = self.active.lock().await;
            match guard.take() {
                Some(active) => Some(self.close(active).await),
                None => None,
            }
        };
        if let Some(closed) = closed {
            let version = closed.active.version.clone();
            if let Err(e) = self.finish(closed, None).await {
                error!("[recording] stop {} on shutdown failed: {}", version, e);
            }
        }
    }

    /// Versions left in `recording` by a crashed process need a human
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for show_id in self.versions.list_shows().await? {
            for record in self.versions.list(&show_id).await? {
                if record.status != VersionStatus::Recording {
                    continue;
                }
                warn!(
                    "[recording] {}/{} was interrupted by a restart",
                    record.show_id, record.version
                );
                let markers = self
                    .versions
                    .load_markers(&record.show_id, &record.version)
                    .await
                    .unwrap_or_default();
                self.versions
                    .transition(
                        &record.show_id,
                        &record.version,
                        VersionStatus::Failed,
                        |r| {
                            r.marker_count = markers.len();
                            r.needs_inspection = true;
                            r.error_message =
                                Some("recording interrupted by server restart".to_string());
                        },
                    )
                    .await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn watch_tap(manager: Weak<Self>, mut rx: broadcast::Receiver<StudioEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[recording] event watcher lagged by {}", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let (version, message) = match event {
                StudioEvent::TapFailed { version, message } => (version, message),
                _ => continue,
            };
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let closed = {
                let mut guard = manager.active.lock().await;
                match guard.take() {
                    Some(active) if active.matches(&version) => Some(manager.close(active).await),
                    other => {
                        *guard = other;
                        None
                    }
                }
            };
            if let Some(closed) = closed {
                if let Err(e) = manager.finish(closed, Some(message)).await {
                    error!("[recording] fail {}: {}", version, e);
                }
            }
        }
    }

    async fn run_budget(
        manager: Weak<Self>,
        version: String,
        started: Instant,
        token: CancellationToken,
    ) {
        let steps = match manager.upgrade() {
            Some(manager) => budget::schedule(&manager.config),
            None => return,
        };
        for (at, step) in steps {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(started + at) => {}
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match step {
                BudgetStep::Warn { remaining } => {
                    info!(
                        "[recording] {} has {}s of budget left",
                        version,
                        remaining.as_secs()
                    );
                    manager.emit(StudioEvent::BudgetWarning {
                        version: version.clone(),
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
                BudgetStep::Stop => {
                    warn!("[recording] {} used up its budget, stopping", version);
                    if let Err(e) = manager.stop(&version).await {
                        warn!("[recording] budget stop {}: {}", version, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::recording::TrackType;
    use api::wav::streaming_header;
    use std::time::Duration;
    use storage::{BlobStore, StorageConfig};

    use crate::audio::StreamFormat;
    use crate::catalog::StaticCatalog;
    use crate::new_broadcast_channel;
    use crate::relay::sink::NullSink;

    struct Fixture {
        _dir: tempfile::TempDir,
        relay: Arc<Relay>,
        versions: Arc<VersionStore>,
        manager: Arc<RecordingManager>,
    }

    async fn fixture(config: RecordingConfig) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let store = BlobStore::from_config(&StorageConfig::fs(dir.path().to_string_lossy()))
            .await
            .unwrap();
        let events = new_broadcast_channel!(64);
        let relay = Arc::new(Relay::new(Box::new(NullSink), events.clone()));
        let versions = Arc::new(VersionStore::new(store, Duration::from_secs(60)));
        let manager = RecordingManager::new(
            relay.clone(),
            versions.clone(),
            Arc::new(StaticCatalog::default()),
            config,
            events,
        );
        Fixture {
            _dir: dir,
            relay,
            versions,
            manager,
        }
    }

    fn marker(offset_ms: Option<i64>) -> AddMarker {
        AddMarker {
            artist_id: "A".to_string(),
            track_type: TrackType::Track1,
            track_key: "artists/A/track1.wav".to_string(),
            duration_ms: 8_000,
            offset_ms,
        }
    }

    #[tokio::test]
    async fn test_recording_requires_live_stream() {
        let f = fixture(RecordingConfig::default()).await;
        assert!(matches!(
            f.manager.start("show").await,
            Err(AppError::NotLive)
        ));
        assert!(matches!(
            f.manager.add_marker("v", marker(Some(0))).await,
            Err(AppError::NotRecording)
        ));
        assert!(matches!(
            f.manager.stop("v").await,
            Err(AppError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_record_markers_and_stop() {
        let f = fixture(RecordingConfig::default()).await;
        let format = StreamFormat::pcm16(8_000, 1);
        let opened = f.relay.open("alice", false).await.unwrap();
        f.relay
            .send(&opened.handle, &streaming_header(&format))
            .await
            .unwrap();

        let started = f.manager.start("show").await.unwrap();
        assert!(matches!(
            f.manager.start("show").await,
            Err(AppError::AlreadyRecording(_))
        ));

        // half a second of audio
        f.relay
            .send(&opened.handle, &vec![0u8; 8_000])
            .await
            .unwrap();
        let first = f
            .manager
            .add_marker(&started.version, marker(Some(-250)))
            .await
            .unwrap();
        assert_eq!(first.offset_ms, 0);
        let second = f
            .manager
            .add_marker(&started.version, marker(None))
            .await
            .unwrap();
        assert_eq!(second.index, 1);
        assert!(matches!(
            f.manager.add_marker("other", marker(None)).await,
            Err(AppError::NotRecording)
        ));
        assert!(matches!(
            f.manager.stop("other").await,
            Err(AppError::NotRecording)
        ));

        let state = f.manager.status().await;
        assert!(state.is_recording);
        assert_eq!(state.marker_count, 2);
        assert_eq!(state.version.as_deref(), Some(started.version.as_str()));

        let stopped = f.manager.stop(&started.version).await.unwrap();
        assert_eq!(stopped.status, VersionStatus::Raw);
        assert_eq!(stopped.duration_ms, 500);
        assert_eq!(stopped.marker_count, 2);

        let record = f.versions.get("show", &started.version).await.unwrap();
        assert_eq!(record.status, VersionStatus::Raw);
        assert_eq!(record.marker_count, 2);
        let markers = f
            .versions
            .load_markers("show", &started.version)
            .await
            .unwrap();
        assert_eq!(markers.len(), 2);
        assert!(markers.iter().all(|m| m.duration_ms <= 500));
        assert!(!f.manager.status().await.is_recording);
    }

    #[tokio::test]
    async fn test_marker_past_budget_is_rejected() {
        let f = fixture(RecordingConfig {
            budget_secs: 60,
            ..Default::default()
        })
        .await;
        let opened = f.relay.open("alice", false).await.unwrap();
        f.relay
            .send(
                &opened.handle,
                &streaming_header(&StreamFormat::pcm16(8_000, 1)),
            )
            .await
            .unwrap();
        let started = f.manager.start("show").await.unwrap();

        assert!(matches!(
            f.manager
                .add_marker(&started.version, marker(Some(i64::MAX)))
                .await,
            Err(AppError::BadRequest(_))
        ));
        let mut long = marker(Some(1_000));
        long.duration_ms = u64::MAX;
        let added = f.manager.add_marker(&started.version, long).await.unwrap();
        assert_eq!(added.marker_count, 1);

        f.relay
            .send(&opened.handle, &vec![0u8; 16_000])
            .await
            .unwrap();
        let stopped = f.manager.stop(&started.version).await.unwrap();
        assert_eq!(stopped.duration_ms, 1_000);
        let markers = f
            .versions
            .load_markers("show", &started.version)
            .await
            .unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].duration_ms, 1_000);
    }

    #[tokio::test]
    async fn test_start_right_after_stop() {
        let f = fixture(RecordingConfig::default()).await;
        let opened = f.relay.open("alice", false).await.unwrap();
        f.relay
            .send(
                &opened.handle,
                &streaming_header(&StreamFormat::pcm16(8_000, 1)),
            )
            .await
            .unwrap();
        f.relay.send(&opened.handle, &[0u8; 1_600]).await.unwrap();
        let first = f.manager.start("show").await.unwrap();

        let manager = f.manager.clone();
        let version = first.version.clone();
        let stopping = tokio::spawn(async move { manager.stop(&version).await });
        let second = loop {
            match f.manager.start("show").await {
                Ok(started) => break started,
                Err(AppError::AlreadyRecording(_)) => tokio::task::yield_now().await,
                Err(e) => panic!("start after stop failed: {}", e),
            }
        };
        assert_eq!(
            stopping.await.unwrap().unwrap().status,
            VersionStatus::Raw
        );
        assert_ne!(first.version, second.version);

        let record = f.versions.get("show", &second.version).await.unwrap();
        assert_eq!(record.status, VersionStatus::Recording);
        f.manager.stop(&second.version).await.unwrap();
    }

    #[tokio::test]
    async fn test_format_change_fails_recording() {
        let f = fixture(RecordingConfig::default()).await;
        let first = f.relay.open("alice", false).await.unwrap();
        f.relay
            .send(&first.handle, &streaming_header(&StreamFormat::pcm16(8_000, 1)))
            .await
            .unwrap();
        let started = f.manager.start("show").await.unwrap();

        let second = f.relay.open("alice", false).await.unwrap();
        f.relay
            .send(
                &second.handle,
                &streaming_header(&StreamFormat::pcm16(16_000, 2)),
            )
            .await
            .unwrap();
        f.relay.send(&second.handle, &[0u8; 64]).await.unwrap();

        let mut stopped = false;
        for _ in 0..100 {
            if !f.manager.status().await.is_recording {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stopped);
        let record = f.versions.get("show", &started.version).await.unwrap();
        assert_eq!(record.status, VersionStatus::Failed);
        assert!(record.needs_inspection);
    }

    #[tokio::test]
    async fn test_recover_marks_interrupted_versions() {
        let f = fixture(RecordingConfig::default()).await;
        let (version, at) = f.versions.mint();
        f.versions
            .create(&VersionRecord::new(
                "show",
                &version,
                VersionStatus::Recording,
                at.timestamp_millis(),
            ))
            .await
            .unwrap();
        assert_eq!(f.manager.recover().await.unwrap(), 1);
        let record = f.versions.get("show", &version).await.unwrap();
        assert_eq!(record.status, VersionStatus::Failed);
        assert!(record.needs_inspection);
        assert_eq!(f.manager.recover().await.unwrap(), 0);
    }
}
