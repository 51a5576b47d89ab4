use std::path::{Path, PathBuf};
use std::sync::Arc;

use api::event::{FinalizePhase, FinalizeProgress};
use api::recording::{self, Marker, VersionStatus};
use chrono::Utc;
use storage::{path, BlobStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, Download, Overlay};
use super::merge::{probe_raw, render_mix, render_overlay, OverlayInput};
use super::{FinalizeContext, JobState};
use crate::error::AppError;
use crate::recording::VersionRecord;
use crate::result::Result;

const RAW_FILE: &str = "raw.wav";
const FINAL_FILE: &str = "final.wav";

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

fn track_file(index: usize, key: &str) -> String {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    format!("track-{:03}.{}", index, ext)
}

/// Stream a local file into `key` through a chunked writer
async fn upload_file<F>(store: &BlobStore, key: &str, local: &Path, chunk: u64, mut sent: F) -> anyhow::Result<u64>
where
    F: FnMut(u64),
{
    let mut file = tokio::fs::File::open(local).await?;
    let mut writer = store.writer(key).await?;
    let mut buf = vec![0u8; chunk as usize];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(buf[..n].to_vec()).await?;
        total += n as u64;
        sent(total);
    }
    writer.close().await?;
    Ok(total)
}

/// One run of the finalize pipeline for a version
pub(super) struct Job {
    ctx: Arc<FinalizeContext>,
    state: Arc<JobState>,
    checkpoint: Checkpoint,
    resumed: bool,
    dir: PathBuf,
    raw_key: String,
    final_key: String,
    /// Sorted by offset, ties keep arrival order
    markers: Vec<Marker>,
    /// Raw capture first, then each distinct track
    inputs: Vec<String>,
}

impl Job {
    /// Load markers and decide where to start. A previous checkpoint makes
    /// this a resumed run.
    pub(super) async fn prepare(
        ctx: Arc<FinalizeContext>,
        record: &VersionRecord,
        previous: Option<Checkpoint>,
    ) -> Result<Self> {
        let mut markers = ctx
            .versions
            .load_markers(&record.show_id, &record.version)
            .await?;
        markers.sort_by_key(|m| m.offset_ms);
        let kept = recording::keep_within(&mut markers, record.duration_ms);
        if kept < record.marker_count {
            warn!(
                "[finalize] {}/{} ignores {} markers past the end of the recording",
                record.show_id,
                record.version,
                record.marker_count - kept
            );
        }

        let mut inputs = vec![record.raw_key.clone()];
        for marker in &markers {
            if !inputs.contains(&marker.track_key) {
                inputs.push(marker.track_key.clone());
            }
        }

        let dir = PathBuf::from(&ctx.config.work_dir)
            .join(&record.show_id)
            .join(&record.version);
        tokio::fs::create_dir_all(&dir).await?;

        let resumed = previous.is_some();
        let mut checkpoint =
            previous.unwrap_or_else(|| Checkpoint::new(&record.show_id, &record.version));
        checkpoint.error = None;
        Self::forget_lost_files(&mut checkpoint, &dir).await;

        let phase = match checkpoint.resume_phase(inputs.len()) {
            // upload finished but the version was never marked, just mark it
            FinalizePhase::Complete => FinalizePhase::Uploading,
            phase => phase,
        };
        checkpoint.phase = phase;
        checkpoint.percent = 0;
        checkpoint.detail = if resumed {
            format!("resuming at {}", phase)
        } else {
            "queued".to_string()
        };
        let state = JobState::new(checkpoint.progress(resumed));

        Ok(Self {
            ctx,
            state,
            checkpoint,
            resumed,
            dir,
            raw_key: record.raw_key.clone(),
            final_key: record.final_key.clone(),
            markers,
            inputs,
        })
    }

    /// Steps whose local output is gone have to be done again
    async fn forget_lost_files(checkpoint: &mut Checkpoint, dir: &Path) {
        let mut lost = Vec::new();
        for (key, download) in &checkpoint.downloads {
            match tokio::fs::metadata(dir.join(&download.file)).await {
                Ok(meta) if meta.len() == download.size => {}
                _ => lost.push(key.clone()),
            }
        }
        for key in lost {
            debug!("[finalize] local copy of {} is gone", key);
            checkpoint.downloads.remove(&key);
        }

        let mut overlays = Vec::with_capacity(checkpoint.overlays.len());
        for overlay in checkpoint.overlays.drain(..) {
            if tokio::fs::try_exists(dir.join(&overlay.file))
                .await
                .unwrap_or(false)
            {
                overlays.push(overlay);
            }
        }
        checkpoint.overlays = overlays;

        if checkpoint.rendered
            && !checkpoint.uploaded
            && !tokio::fs::try_exists(dir.join(FINAL_FILE))
                .await
                .unwrap_or(false)
        {
            checkpoint.rendered = false;
        }
    }

    pub(super) fn state(&self) -> Arc<JobState> {
        self.state.clone()
    }

    fn report(&self, phase: FinalizePhase, percent: u8, detail: &str) {
        self.state.update(phase, percent, detail);
    }

    async fn save(&mut self) -> Result<()> {
        let latest = self.state.latest();
        self.checkpoint.phase = latest.phase;
        self.checkpoint.percent = latest.percent;
        self.checkpoint.detail = latest.detail;
        self.checkpoint.updated_at = Utc::now().timestamp_millis();

        let key = path::checkpoint_key(&self.checkpoint.show_id, &self.checkpoint.version);
        let store = &self.ctx.store;
        let checkpoint = &self.checkpoint;
        self.ctx
            .retry
            .run("save checkpoint", || store.put_json(&key, checkpoint))
            .await
            .map_err(AppError::storage)
    }

    pub(super) async fn run(mut self) -> FinalizeProgress {
        info!(
            "[finalize] {}/{} starting at {} (resumed={})",
            self.checkpoint.show_id, self.checkpoint.version, self.checkpoint.phase, self.resumed
        );
        match self.execute().await {
            Ok(()) => {}
            Err(e) => self.fail(e).await,
        }
        self.state.latest()
    }

    async fn execute(&mut self) -> Result<()> {
        if self.checkpoint.resume_phase(self.inputs.len()) == FinalizePhase::Downloading {
            self.download().await?;
        }
        if !self.checkpoint.rendered && !self.checkpoint.uploaded {
            self.merge().await?;
        }
        if !self.checkpoint.uploaded {
            self.upload().await?;
        }
        self.complete().await
    }

    pub(super) async fn download(&mut self) -> Result<()> {
        let inputs = self.inputs.clone();
        let store = self.ctx.store.clone();
        let retry = self.ctx.retry;

        let mut sizes = Vec::with_capacity(inputs.len());
        for key in &inputs {
            let size = retry
                .run(&format!("stat {}", key), || store.stat(key))
                .await
                .map_err(AppError::storage)?
                .ok_or_else(|| AppError::not_found(format!("{} is missing from storage", key)))?;
            sizes.push(size);
        }
        let total: u64 = sizes.iter().sum();
        self.checkpoint.total_bytes = total;

        let mut done: u64 = inputs
            .iter()
            .zip(&sizes)
            .filter(|(key, _)| self.checkpoint.downloads.contains_key(*key))
            .map(|(_, size)| *size)
            .sum();
        self.report(
            FinalizePhase::Downloading,
            percent(done, total),
            &format!("{} files, {} bytes", inputs.len(), total),
        );

        let chunk = self.ctx.config.download_chunk_bytes.max(1);
        for (index, (key, size)) in inputs.iter().zip(sizes).enumerate() {
            if self.checkpoint.downloads.contains_key(key) {
                continue;
            }
            let file = if index == 0 {
                RAW_FILE.to_string()
            } else {
                track_file(index, key)
            };
            let part = self.dir.join(format!("{}.part", file));
            let detail = format!("downloading {}", key);
            let mut out = tokio::fs::File::create(&part).await?;
            let mut offset = 0u64;
            while offset < size {
                let len = chunk.min(size - offset);
                let bytes = retry
                    .run(&format!("read {}", key), || store.range_get(key, offset, len))
                    .await
                    .map_err(AppError::storage)?;
                if bytes.is_empty() {
                    return Err(AppError::storage(format!(
                        "{} ended at {} of {} bytes",
                        key, offset, size
                    )));
                }
                out.write_all(&bytes).await?;
                offset += bytes.len() as u64;
                done += bytes.len() as u64;
                self.report(FinalizePhase::Downloading, percent(done, total), &detail);
            }
            out.flush().await?;
            drop(out);
            tokio::fs::rename(&part, self.dir.join(&file)).await?;

            self.checkpoint
                .downloads
                .insert(key.clone(), Download { size, file });
            debug!("[finalize] fetched {} ({} bytes)", key, size);
            self.save().await?;
        }
        Ok(())
    }

    fn local(&self, key: &str) -> Result<PathBuf> {
        self.checkpoint
            .downloads
            .get(key)
            .map(|d| self.dir.join(&d.file))
            .ok_or_else(|| AppError::throw(format!("{} was not downloaded", key)))
    }

    async fn merge(&mut self) -> Result<()> {
        let raw = self.local(&self.raw_key)?;
        let probe = raw.clone();
        let (format, base_frames) = tokio::task::spawn_blocking(move || probe_raw(&probe))
            .await?
            .map_err(|e| AppError::decode(&self.raw_key, e))?;
        debug!(
            "[finalize] base {}Hz/{}ch, {} frames",
            format.sample_rate, format.channels, base_frames
        );

        let steps = self.markers.len() as u64 + 1;
        let markers = self.markers.clone();
        for (index, marker) in markers.iter().enumerate() {
            if self.checkpoint.is_overlay_done(index) {
                continue;
            }
            let done = self.checkpoint.overlays.len() as u64;
            self.report(
                FinalizePhase::Merging,
                percent(done, steps),
                &format!("mixing {} at {}ms", marker.track_key, marker.offset_ms),
            );

            let track = self.local(&marker.track_key)?;
            let file = format!("overlay-{:03}.wav", index);
            let out = self.dir.join(&file);
            let max_frames = format.frames_for_ms(marker.duration_ms);
            let frames = tokio::task::spawn_blocking(move || {
                render_overlay(&track, &format, max_frames, &out)
            })
            .await?
            .map_err(|e| AppError::decode(&marker.track_key, e))?;
            if frames < max_frames {
                debug!(
                    "[finalize] {} is shorter than its marker, {} of {} frames",
                    marker.track_key, frames, max_frames
                );
            }

            self.checkpoint.overlays.push(Overlay {
                index,
                start_frame: format.frames_for_ms(marker.offset_ms),
                frames,
                file,
            });
            let done = self.checkpoint.overlays.len() as u64;
            self.report(
                FinalizePhase::Merging,
                percent(done, steps),
                &format!("mixed {} of {} tracks", done, markers.len()),
            );
            self.save().await?;
        }

        let mut overlays = self.checkpoint.overlays.clone();
        overlays.sort_by_key(|o| o.index);
        let inputs: Vec<OverlayInput> = overlays
            .iter()
            .map(|o| OverlayInput {
                start_frame: o.start_frame,
                frames: o.frames,
                path: self.dir.join(&o.file),
            })
            .collect();
        let out = self.dir.join(FINAL_FILE);
        let state = self.state.clone();
        let done = steps - 1;
        let rendered = tokio::task::spawn_blocking(move || {
            render_mix(&raw, &inputs, &out, |frames, total| {
                let pct = percent(done * total + frames, steps * total).min(99);
                state.update(FinalizePhase::Merging, pct, "rendering mix");
            })
        })
        .await??;

        self.checkpoint.rendered = true;
        self.checkpoint.rendered_frames = rendered;
        self.report(FinalizePhase::Merging, 100, "mix rendered");
        self.save().await
    }

    async fn upload(&mut self) -> Result<()> {
        let local = self.dir.join(FINAL_FILE);
        let size = tokio::fs::metadata(&local).await?.len();
        self.report(
            FinalizePhase::Uploading,
            0,
            &format!("uploading {} bytes", size),
        );

        let store = self.ctx.store.clone();
        let key = self.final_key.clone();
        let chunk = self.ctx.config.upload_chunk_bytes.max(1);
        let state = self.state.clone();
        let detail = format!("uploading {}", key);
        self.ctx
            .retry
            .run("upload final mix", || {
                upload_file(&store, &key, &local, chunk, |sent| {
                    state.update(FinalizePhase::Uploading, percent(sent, size), &detail)
                })
            })
            .await
            .map_err(AppError::storage)?;

        self.checkpoint.uploaded = true;
        self.report(FinalizePhase::Uploading, 100, "uploaded");
        self.save().await
    }

    async fn complete(&mut self) -> Result<()> {
        let show_id = self.checkpoint.show_id.clone();
        let version = self.checkpoint.version.clone();
        let rendered_frames = self.checkpoint.rendered_frames;

        self.checkpoint.phase = FinalizePhase::Complete;
        self.checkpoint.percent = 100;
        self.checkpoint.detail = "final mix ready".to_string();
        self.checkpoint.updated_at = Utc::now().timestamp_millis();
        let key = path::checkpoint_key(&show_id, &version);
        let store = &self.ctx.store;
        let checkpoint = &self.checkpoint;
        self.ctx
            .retry
            .run("save checkpoint", || store.put_json(&key, checkpoint))
            .await
            .map_err(AppError::storage)?;

        let duration_ms = self.rendered_duration_ms(rendered_frames).await;
        self.ctx
            .versions
            .transition(&show_id, &version, VersionStatus::Finalized, |r| {
                r.finalized_at = Some(Utc::now().timestamp_millis());
                r.error_message = None;
                r.needs_inspection = false;
                if let Some(ms) = duration_ms {
                    r.duration_ms = r.duration_ms.max(ms);
                }
            })
            .await?;

        self.report(FinalizePhase::Complete, 100, "final mix ready");
        info!("[finalize] {}/{} complete", show_id, version);
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!("[finalize] clean {}: {}", self.dir.display(), e);
        }
        Ok(())
    }

    async fn rendered_duration_ms(&self, frames: u64) -> Option<u64> {
        let raw = self.local(&self.raw_key).ok()?;
        let (format, _) = tokio::task::spawn_blocking(move || probe_raw(&raw))
            .await
            .ok()?
            .ok()?;
        Some(format.ms_for_frames(frames))
    }

    async fn fail(&mut self, e: AppError) {
        let message = e.to_string();
        let latest = self.state.latest();
        error!(
            "[finalize] {}/{} failed during {}: {}",
            self.checkpoint.show_id, self.checkpoint.version, latest.phase, message
        );

        // the source may get fixed before a retry, fetch it again then
        if let AppError::DecodeFailure { key, .. } = &e {
            self.checkpoint.downloads.remove(key);
        }
        self.checkpoint.error = Some(message.clone());
        self.checkpoint.phase = FinalizePhase::Error;
        self.checkpoint.percent = latest.percent;
        self.checkpoint.detail = message.clone();
        self.checkpoint.updated_at = Utc::now().timestamp_millis();
        let key = path::checkpoint_key(&self.checkpoint.show_id, &self.checkpoint.version);
        if let Err(e) = self.ctx.store.put_json(&key, &self.checkpoint).await {
            error!("[finalize] checkpoint {} lost: {:#}", key, e);
        }

        let error_message = message.clone();
        if let Err(e) = self
            .ctx
            .versions
            .transition(
                &self.checkpoint.show_id,
                &self.checkpoint.version,
                VersionStatus::Failed,
                |r| r.error_message = Some(error_message),
            )
            .await
        {
            error!("[finalize] mark {} failed: {}", self.checkpoint.version, e);
        }
        self.report(FinalizePhase::Error, latest.percent, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn test_track_file_keeps_extension() {
        assert_eq!(track_file(1, "artists/a/voice.mp3"), "track-001.mp3");
        assert_eq!(track_file(12, "artists/a/noext"), "track-012.bin");
    }
}
