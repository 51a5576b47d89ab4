use std::sync::Mutex;
use std::time::Duration;

use api::recording::{Marker, RecordingVersionInfo, VersionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::{path, BlobStore};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::result::Result;

const VERSION_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

/// Persisted as `info.json` next to the raw capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub show_id: String,
    pub version: String,
    pub status: VersionStatus,
    pub marker_count: usize,
    pub duration_ms: u64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub finalized_at: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub needs_inspection: bool,
    pub raw_key: String,
    pub markers_key: String,
    pub final_key: String,
}

impl VersionRecord {
    pub fn new(show_id: &str, version: &str, status: VersionStatus, created_at: i64) -> Self {
        Self {
            show_id: show_id.to_string(),
            version: version.to_string(),
            status,
            marker_count: 0,
            duration_ms: 0,
            created_at,
            updated_at: created_at,
            finalized_at: None,
            error_message: None,
            needs_inspection: false,
            raw_key: path::raw_key(show_id, version),
            markers_key: path::markers_key(show_id, version),
            final_key: path::final_key(show_id, version),
        }
    }
}

pub fn format_version(at: &DateTime<Utc>) -> String {
    at.format(VERSION_FORMAT).to_string()
}

/// Version records of every show
pub struct VersionStore {
    store: BlobStore,
    last_minted: Mutex<i64>,
    // serializes read-modify-write of info.json
    write_lock: tokio::sync::Mutex<()>,
    download_ttl: Duration,
}

impl VersionStore {
    pub fn new(store: BlobStore, download_ttl: Duration) -> Self {
        Self {
            store,
            last_minted: Mutex::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            download_ttl,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// New sortable version id, never equal to the previous one
    pub fn mint(&self) -> (String, DateTime<Utc>) {
        let mut last = self.last_minted.lock().unwrap_or_else(|e| e.into_inner());
        let mut ms = Utc::now().timestamp_millis();
        if ms <= *last {
            ms = *last + 1;
        }
        *last = ms;
        let at = DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now);
        (format_version(&at), at)
    }

    pub async fn create(&self, record: &VersionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .put_json(&path::info_key(&record.show_id, &record.version), record)
            .await
            .map_err(AppError::storage)
    }

    pub async fn find(&self, show_id: &str, version: &str) -> Result<Option<VersionRecord>> {
        if !path::validate_segment(show_id) || !path::validate_segment(version) {
            return Err(AppError::bad_request("invalid show or version"));
        }
        self.store
            .get_json(&path::info_key(show_id, version))
            .await
            .map_err(AppError::storage)
    }

    pub async fn get(&self, show_id: &str, version: &str) -> Result<VersionRecord> {
        self.find(show_id, version).await?.ok_or_else(|| {
            AppError::not_found(format!("recording {}/{} not found", show_id, version))
        })
    }

    pub async fn update<F>(&self, show_id: &str, version: &str, f: F) -> Result<VersionRecord>
    where
        F: FnOnce(&mut VersionRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.get(show_id, version).await?;
        f(&mut record);
        record.updated_at = Utc::now().timestamp_millis();
        self.store
            .put_json(&path::info_key(show_id, version), &record)
            .await
            .map_err(AppError::storage)?;
        Ok(record)
    }

    /// Move to `to`, refusing transitions the lifecycle does not allow
    pub async fn transition<F>(
        &self,
        show_id: &str,
        version: &str,
        to: VersionStatus,
        f: F,
    ) -> Result<VersionRecord>
    where
        F: FnOnce(&mut VersionRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.get(show_id, version).await?;
        if !record.status.can_transition(to) {
            return Err(AppError::InvalidTransition(format!(
                "{}/{} cannot go from {} to {}",
                show_id, version, record.status, to
            )));
        }
        debug!(
            "[recording] {}/{} {} -> {}",
            show_id, version, record.status, to
        );
        record.status = to;
        f(&mut record);
        record.updated_at = Utc::now().timestamp_millis();
        self.store
            .put_json(&path::info_key(show_id, version), &record)
            .await
            .map_err(AppError::storage)?;
        Ok(record)
    }

    /// Versions of a show, newest first
    pub async fn list(&self, show_id: &str) -> Result<Vec<VersionRecord>> {
        if !path::validate_segment(show_id) {
            return Err(AppError::bad_request(format!("invalid show id: {:?}", show_id)));
        }
        let versions = self
            .store
            .list_dirs(&path::show_prefix(show_id))
            .await
            .map_err(AppError::storage)?;
        let mut records = Vec::with_capacity(versions.len());
        for version in versions.iter().rev() {
            match self
                .store
                .get_json::<VersionRecord>(&path::info_key(show_id, version))
                .await
            {
                Ok(Some(record)) => records.push(record),
                Ok(None) => debug!("[recording] {}/{} has no info.json", show_id, version),
                Err(e) => warn!("[recording] skip {}/{}: {:#}", show_id, version, e),
            }
        }
        Ok(records)
    }

    pub async fn list_shows(&self) -> Result<Vec<String>> {
        self.store
            .list_dirs(&format!("{}/", path::RECORDINGS))
            .await
            .map_err(AppError::storage)
    }

    pub async fn save_markers(&self, show_id: &str, version: &str, markers: &[Marker]) -> Result<()> {
        self.store
            .put_json(&path::markers_key(show_id, version), &markers)
            .await
            .map_err(AppError::storage)
    }

    pub async fn load_markers(&self, show_id: &str, version: &str) -> Result<Vec<Marker>> {
        Ok(self
            .store
            .get_json(&path::markers_key(show_id, version))
            .await
            .map_err(AppError::storage)?
            .unwrap_or_default())
    }

    /// Public view of a record, with a download link once finalized
    pub async fn info(&self, record: &VersionRecord) -> RecordingVersionInfo {
        let download_url = if record.status == VersionStatus::Finalized {
            match self
                .store
                .presign_read(&record.final_key, self.download_ttl)
                .await
            {
                Ok(Some(url)) => Some(url),
                Ok(None) => Some(api::path::recording_download(
                    &record.show_id,
                    &record.version,
                )),
                Err(e) => {
                    warn!("[recording] presign {} failed: {:#}", record.final_key, e);
                    Some(api::path::recording_download(
                        &record.show_id,
                        &record.version,
                    ))
                }
            }
        } else {
            None
        };
        RecordingVersionInfo {
            show_id: record.show_id.clone(),
            version: record.version.clone(),
            status: record.status,
            marker_count: record.marker_count,
            duration_ms: record.duration_ms,
            created_at: record.created_at,
            finalized_at: record.finalized_at,
            download_url,
            error_message: match record.status {
                VersionStatus::Failed => record.error_message.clone(),
                _ => None,
            },
            needs_inspection: record.needs_inspection,
        }
    }
}
