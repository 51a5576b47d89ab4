//! Finalize pipeline: download, merge and upload a recorded version.
//!
//! Jobs are single-flight per `(show, version)` and keep running when every
//! subscriber has gone away. Progress is pushed to any number of
//! subscribers, each starting from the latest state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use api::event::{FinalizePhase, FinalizeProgress};
use api::recording::VersionStatus;
use storage::{path, BlobStore};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::FinalizeConfig;
use crate::error::AppError;
use crate::recording::VersionStore;
use crate::result::Result;

pub mod checkpoint;
mod job;
pub mod merge;
pub mod retry;

use checkpoint::Checkpoint;
use job::Job;
use retry::Retry;

const PROGRESS_CAPACITY: usize = 64;

pub struct FinalizeContext {
    pub store: BlobStore,
    pub versions: Arc<VersionStore>,
    pub config: FinalizeConfig,
    pub retry: Retry,
}

/// Latest progress of a running job plus its fan-out channel
pub struct JobState {
    latest: StdMutex<FinalizeProgress>,
    tx: broadcast::Sender<FinalizeProgress>,
}

impl JobState {
    fn new(initial: FinalizeProgress) -> Arc<Self> {
        let (tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Arc::new(Self {
            latest: StdMutex::new(initial),
            tx,
        })
    }

    pub fn latest(&self) -> FinalizeProgress {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish unless nothing changed
    fn update(&self, phase: FinalizePhase, percent: u8, detail: &str) {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        if latest.phase == phase && latest.percent == percent && latest.detail == detail {
            return;
        }
        latest.phase = phase;
        latest.percent = percent;
        latest.detail = detail.to_string();
        let _ = self.tx.send(latest.clone());
    }

    // Snapshot and receiver under one lock, so nothing falls in between
    fn subscribe(&self) -> (FinalizeProgress, broadcast::Receiver<FinalizeProgress>) {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        (latest.clone(), self.tx.subscribe())
    }
}

/// Catch-up snapshot and, while the job runs, the live feed
pub struct Subscription {
    pub snapshot: FinalizeProgress,
    pub rx: Option<broadcast::Receiver<FinalizeProgress>>,
    job: Option<Arc<JobState>>,
}

impl Subscription {
    fn attach(job: Arc<JobState>) -> Self {
        let (snapshot, rx) = job.subscribe();
        Self {
            snapshot,
            rx: Some(rx),
            job: Some(job),
        }
    }

    fn detached(snapshot: FinalizeProgress) -> Self {
        Self {
            snapshot,
            rx: None,
            job: None,
        }
    }

    /// Current state, used to recover after lagging behind the feed
    pub fn latest(&self) -> FinalizeProgress {
        match &self.job {
            Some(job) => job.latest(),
            None => self.snapshot.clone(),
        }
    }

    pub fn same_job(&self, other: &Subscription) -> bool {
        match (&self.job, &other.job) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

type JobKey = (String, String);
type JobMap = Arc<StdMutex<HashMap<JobKey, Arc<JobState>>>>;

pub struct Finalizer {
    ctx: Arc<FinalizeContext>,
    jobs: JobMap,
    start_lock: Mutex<()>,
}

fn progress(show_id: &str, version: &str, phase: FinalizePhase, detail: String) -> FinalizeProgress {
    FinalizeProgress {
        show_id: show_id.to_string(),
        version: version.to_string(),
        phase,
        percent: if phase == FinalizePhase::Complete { 100 } else { 0 },
        detail,
        resumed: false,
    }
}

impl Finalizer {
    pub fn new(store: BlobStore, versions: Arc<VersionStore>, config: FinalizeConfig) -> Self {
        let retry = Retry::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_base_ms),
        );
        Self {
            ctx: Arc::new(FinalizeContext {
                store,
                versions,
                config,
                retry,
            }),
            jobs: Default::default(),
            start_lock: Mutex::new(()),
        }
    }

    fn running(&self, key: &JobKey) -> Option<Arc<JobState>> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn load_checkpoint(&self, show_id: &str, version: &str) -> Result<Option<Checkpoint>> {
        self.ctx
            .store
            .get_json(&path::checkpoint_key(show_id, version))
            .await
            .map_err(AppError::storage)
    }

    /// Start finalizing, or attach to the job that already runs
    pub async fn finalize(&self, show_id: &str, version: &str) -> Result<Subscription> {
        let key = (show_id.to_string(), version.to_string());
        let _guard = self.start_lock.lock().await;
        if let Some(job) = self.running(&key) {
            info!("[finalize] {}/{} already running, attaching", show_id, version);
            return Ok(Subscription::attach(job));
        }

        let record = self.ctx.versions.get(show_id, version).await?;
        match record.status {
            VersionStatus::Finalized => {
                return Ok(Subscription::detached(progress(
                    show_id,
                    version,
                    FinalizePhase::Complete,
                    "already finalized".to_string(),
                )))
            }
            VersionStatus::Recording => {
                return Err(AppError::InvalidTransition(format!(
                    "{}/{} is still recording",
                    show_id, version
                )))
            }
            _ => {}
        }

        // a checkpoint next to a raw version is a leftover, start clean
        let previous = match record.status {
            VersionStatus::Raw => None,
            _ => self.load_checkpoint(show_id, version).await?,
        };
        let record = self
            .ctx
            .versions
            .transition(show_id, version, VersionStatus::Finalizing, |r| {
                r.error_message = None;
            })
            .await?;

        let job = match Job::prepare(self.ctx.clone(), &record, previous).await {
            Ok(job) => job,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .ctx
                    .versions
                    .transition(show_id, version, VersionStatus::Failed, |r| {
                        r.error_message = Some(message)
                    })
                    .await;
                return Err(e);
            }
        };
        let state = job.state();
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), state.clone());

        let run = tokio::spawn(job.run());
        tokio::spawn(supervise(
            self.ctx.clone(),
            self.jobs.clone(),
            key,
            state.clone(),
            run,
        ));
        Ok(Subscription::attach(state))
    }

    /// Watch without starting anything
    pub async fn subscribe(&self, show_id: &str, version: &str) -> Result<Subscription> {
        let key = (show_id.to_string(), version.to_string());
        if let Some(job) = self.running(&key) {
            return Ok(Subscription::attach(job));
        }
        let record = self.ctx.versions.get(show_id, version).await?;
        if let Some(checkpoint) = self.load_checkpoint(show_id, version).await? {
            return Ok(Subscription::detached(checkpoint.progress(false)));
        }
        match record.status {
            VersionStatus::Finalized => Ok(Subscription::detached(progress(
                show_id,
                version,
                FinalizePhase::Complete,
                "already finalized".to_string(),
            ))),
            VersionStatus::Failed => Ok(Subscription::detached(progress(
                show_id,
                version,
                FinalizePhase::Error,
                record.error_message.unwrap_or_default(),
            ))),
            _ => Err(AppError::not_found(format!(
                "no finalize job for {}/{}",
                show_id, version
            ))),
        }
    }

    /// Pick up jobs a previous process left in `finalizing`
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let mut resumed = 0;
        for show_id in self.ctx.versions.list_shows().await? {
            for record in self.ctx.versions.list(&show_id).await? {
                if record.status != VersionStatus::Finalizing {
                    continue;
                }
                let key = (record.show_id.clone(), record.version.clone());
                if self.running(&key).is_some() {
                    continue;
                }
                warn!(
                    "[finalize] resuming interrupted job {}/{}",
                    record.show_id, record.version
                );
                match self.finalize(&record.show_id, &record.version).await {
                    Ok(_) => resumed += 1,
                    Err(e) => error!(
                        "[finalize] resume {}/{} failed: {}",
                        record.show_id, record.version, e
                    ),
                }
            }
        }
        Ok(resumed)
    }
}

/// Wait for a job task and take it out of the map, also when it panicked
async fn supervise(
    ctx: Arc<FinalizeContext>,
    jobs: JobMap,
    key: JobKey,
    state: Arc<JobState>,
    run: JoinHandle<FinalizeProgress>,
) -> FinalizeProgress {
    let last = match run.await {
        Ok(last) => last,
        Err(e) => abandon(&ctx, &key, &state, format!("finalize job crashed: {}", e)).await,
    };
    jobs.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
    info!(
        "[finalize] {}/{} ended with {}",
        last.show_id, last.version, last.phase
    );
    last
}

/// Record a job that died without reporting, so a retry can start it again
async fn abandon(
    ctx: &FinalizeContext,
    (show_id, version): &JobKey,
    state: &JobState,
    message: String,
) -> FinalizeProgress {
    error!("[finalize] {}/{}: {}", show_id, version, message);
    let percent = state.latest().percent;

    let key = path::checkpoint_key(show_id, version);
    let mut checkpoint = match ctx.store.get_json::<Checkpoint>(&key).await {
        Ok(Some(checkpoint)) => checkpoint,
        _ => Checkpoint::new(show_id, version),
    };
    checkpoint.phase = FinalizePhase::Error;
    checkpoint.percent = percent;
    checkpoint.detail = message.clone();
    checkpoint.error = Some(message.clone());
    checkpoint.updated_at = Utc::now().timestamp_millis();
    if let Err(e) = ctx.store.put_json(&key, &checkpoint).await {
        error!("[finalize] checkpoint {} lost: {:#}", key, e);
    }

    let error_message = message.clone();
    if let Err(e) = ctx
        .versions
        .transition(show_id, version, VersionStatus::Failed, |r| {
            r.error_message = Some(error_message)
        })
        .await
    {
        error!("[finalize] mark {} failed: {}", version, e);
    }
    state.update(FinalizePhase::Error, percent, &message);
    state.latest()
}

#[cfg(test)]
mod tests;
