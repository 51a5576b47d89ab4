//! Chunked upload client.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use api::request::{TransferInit, TransferMetadata};
use api::response::{ChunkAccepted, TransferComplete, TransferSession};

use crate::backoff::Backoff;
use crate::client::{api_error, Client};

#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn init(&self, init: &TransferInit) -> Result<TransferSession>;
    async fn chunk(&self, session_id: &str, index: u32, bytes: Vec<u8>) -> Result<ChunkAccepted>;
    async fn finalize(&self, session_id: &str) -> Result<TransferComplete>;
    async fn single(&self, metadata: &TransferMetadata, bytes: Vec<u8>) -> Result<TransferComplete>;
}

#[async_trait]
impl TransferApi for Client {
    async fn init(&self, init: &TransferInit) -> Result<TransferSession> {
        self.transfer_init(init).await
    }

    async fn chunk(&self, session_id: &str, index: u32, bytes: Vec<u8>) -> Result<ChunkAccepted> {
        self.transfer_chunk(session_id, index, bytes).await
    }

    async fn finalize(&self, session_id: &str) -> Result<TransferComplete> {
        self.transfer_finalize(session_id).await
    }

    async fn single(&self, metadata: &TransferMetadata, bytes: Vec<u8>) -> Result<TransferComplete> {
        self.transfer_single(metadata, bytes).await
    }
}

const CHUNK_GAP: &str = "chunk_gap";

pub struct Uploader<A> {
    api: A,
    single_limit: u64,
    chunk_bytes: u64,
    backoff: Backoff,
}

impl<A: TransferApi> Uploader<A> {
    pub fn new(api: A, single_limit: u64, chunk_bytes: u64, backoff: Backoff) -> Self {
        Self {
            api,
            single_limit,
            chunk_bytes: chunk_bytes.max(1),
            backoff,
        }
    }

    pub async fn upload(&self, metadata: TransferMetadata, data: &[u8]) -> Result<TransferComplete> {
        let total_size = data.len() as u64;
        if total_size <= self.single_limit {
            debug!("[upload] {} bytes in a single request", total_size);
            return self.api.single(&metadata, data.to_vec()).await;
        }

        let total_chunks = u32::try_from(total_size.div_ceil(self.chunk_bytes))
            .map_err(|_| anyhow!("{} bytes need too many chunks", total_size))?;
        let session = self
            .api
            .init(&TransferInit {
                total_size,
                total_chunks,
                metadata,
            })
            .await?;
        if self.chunk_bytes > session.max_chunk_bytes {
            return Err(anyhow!(
                "chunk size {} exceeds the server limit of {}",
                self.chunk_bytes,
                session.max_chunk_bytes
            ));
        }
        info!(
            "[upload] session {}: {} bytes in {} chunks",
            session.session_id, total_size, total_chunks
        );

        let mut backoff = self.backoff.clone();
        let mut index = 0u32;
        loop {
            if index >= total_chunks {
                match self.api.finalize(&session.session_id).await {
                    Ok(done) => return Ok(done),
                    Err(e) => index = self.recover(e, index, &mut backoff).await?,
                }
                continue;
            }
            let start = index as u64 * self.chunk_bytes;
            let end = (start + self.chunk_bytes).min(total_size);
            let piece = data[start as usize..end as usize].to_vec();
            match self.api.chunk(&session.session_id, index, piece).await {
                Ok(accepted) => {
                    backoff.reset();
                    index = accepted.next_index;
                }
                Err(e) => index = self.recover(e, index, &mut backoff).await?,
            }
        }
    }

    /// Where to carry on after a failed call, or the error if it is final
    async fn recover(&self, err: anyhow::Error, index: u32, backoff: &mut Backoff) -> Result<u32> {
        let resume = match api_error(&err) {
            Some(api) if api.is(CHUNK_GAP) => match api.body.expected {
                Some(expected) => expected,
                None => return Err(err),
            },
            Some(api) if api.status < 500 => return Err(err),
            _ => index,
        };
        let delay = backoff.next_delay().ok_or_else(|| {
            anyhow!(
                "upload stuck at chunk {} after {} attempts: {:#}",
                index,
                backoff.max_attempts(),
                err
            )
        })?;
        warn!(
            "[upload] chunk {} failed ({:#}), resuming at {} in {:?}",
            index, err, resume, delay
        );
        sleep(delay).await;
        Ok(resume)
    }
}
