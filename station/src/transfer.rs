//! Chunked uploads that keep every request under the intermediary ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use api::recording::{self, Marker, VersionStatus};
use api::request::{TransferInit, TransferMetadata};
use api::response::{ChunkAccepted, TransferComplete, TransferSession};
use api::wav::{parse_header, HeaderParse, MAX_HEADER_LEN};
use chrono::Utc;
use storage::{path, BlobStore};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{ensure_show, validate_marker, Catalog};
use crate::config::TransferConfig;
use crate::error::AppError;
use crate::recording::{VersionRecord, VersionStore};
use crate::result::Result;

struct Session {
    id: String,
    operator: String,
    init: TransferInit,
    next_index: u32,
    received_bytes: u64,
    /// Idle deadline, pushed back by every accepted chunk
    expires: Instant,
}

impl Session {
    fn chunk_keys(&self) -> Vec<String> {
        (0..self.next_index)
            .map(|i| path::pending_chunk_key(&self.id, i))
            .collect()
    }
}

/// Where an upload ends up once committed
struct Target {
    key: String,
    version: Option<(String, String, i64)>,
}

pub struct TransferManager {
    store: BlobStore,
    versions: Arc<VersionStore>,
    catalog: Arc<dyn Catalog>,
    config: TransferConfig,
    sessions: StdMutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl TransferManager {
    pub fn new(
        store: BlobStore,
        versions: Arc<VersionStore>,
        catalog: Arc<dyn Catalog>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            versions,
            catalog,
            config,
            sessions: Default::default(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.session_ttl_secs)
    }

    fn session(&self, id: &str) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("transfer session {} not found", id)))
    }

    fn forget(&self, id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn check_metadata(&self, metadata: &TransferMetadata) -> Result<()> {
        match metadata {
            TransferMetadata::Recording {
                show_id, markers, ..
            } => {
                ensure_show(self.catalog.as_ref(), show_id).await?;
                for marker in markers {
                    validate_marker(
                        self.catalog.as_ref(),
                        show_id,
                        &marker.artist_id,
                        &marker.track_key,
                    )
                    .await?;
                }
                Ok(())
            }
            TransferMetadata::File { name } => {
                if path::validate_segment(name) {
                    Ok(())
                } else {
                    Err(AppError::bad_request(format!("invalid file name: {:?}", name)))
                }
            }
        }
    }

    pub async fn init(&self, operator: &str, init: TransferInit) -> Result<TransferSession> {
        if init.total_chunks == 0 || init.total_size == 0 {
            return Err(AppError::bad_request("empty upload"));
        }
        if init.total_size > self.config.max_total_bytes {
            return Err(AppError::bad_request(format!(
                "upload of {} bytes exceeds the {} byte limit",
                init.total_size, self.config.max_total_bytes
            )));
        }
        if init.total_chunks as u64 > init.total_size {
            return Err(AppError::bad_request("more chunks than bytes"));
        }
        let smallest = init.total_size.div_ceil(init.total_chunks as u64);
        if smallest > self.config.max_chunk_bytes {
            return Err(AppError::bad_request(format!(
                "{} chunks cannot carry {} bytes under the {} byte chunk limit",
                init.total_chunks, init.total_size, self.config.max_chunk_bytes
            )));
        }
        self.check_metadata(&init.metadata).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let ttl = self.ttl();
        info!(
            "[transfer] {} opened by {}: {} bytes in {} chunks",
            id, operator, init.total_size, init.total_chunks
        );
        let session = Session {
            id: id.clone(),
            operator: operator.to_string(),
            init,
            next_index: 0,
            received_bytes: 0,
            expires: Instant::now() + ttl,
        };
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::new(Mutex::new(session)));

        Ok(TransferSession {
            session_id: id,
            max_chunk_bytes: self.config.max_chunk_bytes,
            expires_at: (Utc::now() + ttl).timestamp_millis(),
        })
    }

    /// Stage one chunk. Only the next expected index is accepted.
    pub async fn chunk(
        &self,
        operator: &str,
        id: &str,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<ChunkAccepted> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        if session.operator != operator {
            return Err(AppError::Forbidden(format!(
                "transfer {} belongs to {}",
                id, session.operator
            )));
        }
        if index != session.next_index {
            return Err(AppError::ChunkGap {
                expected: session.next_index,
                got: index,
            });
        }
        if index >= session.init.total_chunks {
            return Err(AppError::bad_request(format!(
                "chunk {} past the announced {} chunks",
                index, session.init.total_chunks
            )));
        }
        if bytes.is_empty() {
            return Err(AppError::bad_request("empty chunk"));
        }
        let len = bytes.len() as u64;
        if len > self.config.max_chunk_bytes {
            return Err(AppError::bad_request(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                len, self.config.max_chunk_bytes
            )));
        }
        if session.received_bytes + len > session.init.total_size {
            return Err(AppError::bad_request(format!(
                "chunk {} overruns the announced {} bytes",
                index, session.init.total_size
            )));
        }

        self.store
            .put(&path::pending_chunk_key(id, index), bytes)
            .await
            .map_err(AppError::storage)?;
        session.next_index += 1;
        session.received_bytes += len;
        session.expires = Instant::now() + self.ttl();
        debug!("[transfer] {} chunk {} ({} bytes)", id, index, len);

        Ok(ChunkAccepted {
            session_id: id.to_string(),
            index,
            next_index: session.next_index,
            received_bytes: session.received_bytes,
        })
    }

    /// Assemble the staged chunks in index order and commit the object
    pub async fn finalize_upload(&self, operator: &str, id: &str) -> Result<TransferComplete> {
        let session = self.session(id)?;
        let session = session.lock().await;
        if session.operator != operator {
            return Err(AppError::Forbidden(format!(
                "transfer {} belongs to {}",
                id, session.operator
            )));
        }
        if session.next_index != session.init.total_chunks {
            return Err(AppError::ChunkGap {
                expected: session.next_index,
                got: session.init.total_chunks,
            });
        }
        if session.received_bytes != session.init.total_size {
            return Err(AppError::bad_request(format!(
                "received {} of {} bytes",
                session.received_bytes, session.init.total_size
            )));
        }

        let target = self.target(id, &session.init.metadata);
        let chunks = session.chunk_keys();
        let mut writer = self
            .store
            .writer(&target.key)
            .await
            .map_err(AppError::storage)?;
        for key in &chunks {
            let bytes = self.store.get(key).await.map_err(AppError::storage)?;
            writer.write(bytes).await.map_err(AppError::storage)?;
        }
        writer.close().await.map_err(AppError::storage)?;

        let complete = self
            .register(target, &session.init.metadata, session.received_bytes)
            .await?;
        for key in &chunks {
            if let Err(e) = self.store.delete(key).await {
                warn!("[transfer] leftover chunk {}: {}", key, e);
            }
        }
        drop(session);
        self.forget(id);
        info!("[transfer] {} committed to {}", id, complete.final_key);
        Ok(complete)
    }

    /// Small uploads skip the session dance
    pub async fn single(&self, metadata: TransferMetadata, bytes: Vec<u8>) -> Result<TransferComplete> {
        let size = bytes.len() as u64;
        if size == 0 {
            return Err(AppError::bad_request("empty upload"));
        }
        if size > self.config.single_request_limit_bytes {
            return Err(AppError::bad_request(format!(
                "{} bytes is above the single request limit of {}, use a chunked transfer",
                size, self.config.single_request_limit_bytes
            )));
        }
        self.check_metadata(&metadata).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let target = self.target(&id, &metadata);
        self.store
            .put(&target.key, bytes)
            .await
            .map_err(AppError::storage)?;
        let complete = self.register(target, &metadata, size).await?;
        info!("[transfer] single upload committed to {}", complete.final_key);
        Ok(complete)
    }

    fn target(&self, id: &str, metadata: &TransferMetadata) -> Target {
        match metadata {
            TransferMetadata::Recording { show_id, .. } => {
                let (version, at) = self.versions.mint();
                Target {
                    key: path::raw_key(show_id, &version),
                    version: Some((show_id.clone(), version, at.timestamp_millis())),
                }
            }
            TransferMetadata::File { name } => Target {
                key: path::upload_key(id, name),
                version: None,
            },
        }
    }

    /// Turn an uploaded raw capture into a new `raw` version
    async fn register(
        &self,
        target: Target,
        metadata: &TransferMetadata,
        size: u64,
    ) -> Result<TransferComplete> {
        let Some((show_id, version, created_at)) = target.version else {
            return Ok(TransferComplete {
                final_key: target.key,
                size,
                show_id: None,
                version: None,
            });
        };
        let TransferMetadata::Recording {
            markers,
            duration_ms,
            ..
        } = metadata
        else {
            return Err(AppError::throw("recording target without recording metadata"));
        };

        let head = self
            .store
            .range_get(&target.key, 0, size.min(MAX_HEADER_LEN as u64))
            .await
            .map_err(AppError::storage)?;
        let measured = match parse_header(&head) {
            Ok(HeaderParse::Ready {
                format,
                data_offset,
            }) => format
                .validate()
                .map(|_| format.ms_for_bytes(size.saturating_sub(data_offset as u64))),
            Ok(HeaderParse::Incomplete) => Err("truncated wav header".to_string()),
            Err(e) => Err(e),
        };
        let measured = match measured {
            Ok(ms) => ms,
            Err(reason) => {
                self.discard(&target.key).await;
                return Err(AppError::decode(&target.key, reason));
            }
        };
        // the audio itself is the upper bound for the claimed length
        let duration_ms = duration_ms.map_or(measured, |d| d.min(measured));
        if let Some(late) = markers.iter().find(|m| m.offset_ms > duration_ms) {
            self.discard(&target.key).await;
            return Err(AppError::bad_request(format!(
                "marker for {} at {}ms is past the end of the {}ms recording",
                late.track_key, late.offset_ms, duration_ms
            )));
        }

        let mut markers: Vec<Marker> = markers.clone();
        markers.sort_by_key(|m| m.offset_ms);
        recording::keep_within(&mut markers, duration_ms);
        let mut record = VersionRecord::new(&show_id, &version, VersionStatus::Raw, created_at);
        record.marker_count = markers.len();
        record.duration_ms = duration_ms;
        self.versions
            .save_markers(&show_id, &version, &markers)
            .await?;
        self.versions.create(&record).await?;
        info!(
            "[transfer] ingested {}/{}: {}ms, {} markers",
            show_id, version, record.duration_ms, record.marker_count
        );

        Ok(TransferComplete {
            final_key: target.key,
            size,
            show_id: Some(show_id),
            version: Some(version),
        })
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!("[transfer] remove rejected {}: {}", key, e);
        }
    }

    /// Drop sessions idle past their deadline along with their chunks
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        let mut swept = 0;
        for (id, session) in candidates {
            // busy sessions are not idle
            let Ok(session) = session.try_lock() else {
                continue;
            };
            if session.expires > now {
                continue;
            }
            for key in session.chunk_keys() {
                if let Err(e) = self.store.delete(&key).await {
                    warn!("[transfer] expired chunk {}: {}", key, e);
                }
            }
            drop(session);
            self.forget(&id);
            info!("[transfer] {} expired", id);
            swept += 1;
        }
        swept
    }

    /// Periodic sweeper, ends with the manager
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep().await;
            }
        });
    }
}
