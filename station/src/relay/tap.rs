use anyhow::anyhow;
use api::wav::streaming_header;
use storage::{Appender, BlobStore};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::StreamFormat;

/// Reconnect gaps shorter than this are not padded
const GAP_TOLERANCE_MS: u64 = 250;
/// Silence is appended in pieces of at most this many milliseconds
const SILENCE_PIECE_MS: u64 = 1000;

/// Copy of the live PCM going to `recordings/{show}/{version}/raw`.
///
/// The object starts with its own header, so it is a valid container from
/// byte zero no matter where in the live stream recording began.
pub struct RawTap {
    pub show_id: String,
    pub version: String,
    pub key: String,
    store: BlobStore,
    appender: Option<Appender>,
    format: Option<StreamFormat>,
    anchor: Instant,
    frames: u64,
    last_session: Option<Uuid>,
    failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TapSummary {
    pub show_id: String,
    pub version: String,
    pub key: String,
    pub format: Option<StreamFormat>,
    pub frames: u64,
    pub bytes: u64,
    pub failure: Option<String>,
}

impl TapSummary {
    pub fn duration_ms(&self) -> u64 {
        self.format
            .map(|f| f.ms_for_frames(self.frames))
            .unwrap_or_default()
    }
}

impl RawTap {
    pub fn new(store: BlobStore, show_id: String, version: String, key: String) -> Self {
        Self {
            show_id,
            version,
            key,
            store,
            appender: None,
            format: None,
            anchor: Instant::now(),
            frames: 0,
            last_session: None,
            failure: None,
        }
    }

    /// Remember the first failure. Later writes become no-ops.
    fn fail(&mut self, e: anyhow::Error) -> anyhow::Result<()> {
        let message = format!("{:#}", e);
        warn!("[relay] raw capture {} failed: {}", self.key, message);
        self.failure = Some(message);
        Err(e)
    }

    /// Write the header now when the live format is already known
    pub async fn prime(&mut self, session: Uuid, format: StreamFormat) -> anyhow::Result<()> {
        self.last_session = Some(session);
        self.open(format).await
    }

    async fn open(&mut self, format: StreamFormat) -> anyhow::Result<()> {
        if self.appender.is_some() {
            return Ok(());
        }
        match self.store.appender(&self.key, streaming_header(&format)).await {
            Ok(appender) => {
                info!(
                    "[relay] raw capture {} opened {}Hz/{}ch",
                    self.key, format.sample_rate, format.channels
                );
                self.format = Some(format);
                self.appender = Some(appender);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Append whole frames of `pcm`. Only the first failure is reported.
    pub async fn write(
        &mut self,
        session: Uuid,
        format: StreamFormat,
        pcm: &[u8],
    ) -> anyhow::Result<()> {
        if self.failure.is_some() {
            return Ok(());
        }
        if let Some(current) = self.format {
            if current != format {
                return self.fail(anyhow!(
                    "stream format changed from {}Hz/{}ch to {}Hz/{}ch",
                    current.sample_rate, current.channels, format.sample_rate, format.channels
                ));
            }
        }
        self.open(format).await?;

        if self.last_session != Some(session) {
            self.last_session = Some(session);
            self.pad_gap(format).await?;
        }

        if pcm.is_empty() {
            return Ok(());
        }
        self.append(pcm.to_vec()).await?;
        self.frames += (pcm.len() / format.block_align()) as u64;
        Ok(())
    }

    /// Keep the capture aligned with wall clock after the stream came back
    async fn pad_gap(&mut self, format: StreamFormat) -> anyhow::Result<()> {
        let expected = format.frames_for_ms(self.anchor.elapsed().as_millis() as u64);
        let tolerance = format.frames_for_ms(GAP_TOLERANCE_MS);
        if expected <= self.frames + tolerance {
            return Ok(());
        }
        let missing = expected - self.frames;
        info!(
            "[relay] padding {} with {}ms of silence",
            self.key,
            format.ms_for_frames(missing)
        );
        let piece = format.frames_for_ms(SILENCE_PIECE_MS).max(1);
        let mut left = missing;
        while left > 0 {
            let n = left.min(piece);
            self.append(vec![0u8; n as usize * format.block_align()])
                .await?;
            left -= n;
        }
        self.frames += missing;
        Ok(())
    }

    async fn append(&mut self, bytes: Vec<u8>) -> anyhow::Result<()> {
        let result = match self.appender.as_mut() {
            Some(appender) => appender.append(bytes).await,
            None => return Ok(()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Commit the object
    pub async fn finish(mut self) -> TapSummary {
        let mut bytes = 0;
        if let Some(appender) = self.appender.take() {
            match appender.close().await {
                Ok(written) => bytes = written,
                Err(e) => {
                    let _ = self.fail(e.context("commit raw capture"));
                }
            }
        }
        TapSummary {
            show_id: self.show_id,
            version: self.version,
            key: self.key,
            format: self.format,
            frames: self.frames,
            bytes,
            failure: self.failure,
        }
    }
}
