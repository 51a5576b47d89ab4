use std::time::Duration;

use anyhow::{Context, Result};
use opendal::{Buffer, ErrorKind, Operator, Writer};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StorageConfig;
use crate::operator::init_operator;

/// Multipart chunk size for backends without native append
const WRITER_CHUNK: usize = 8 * 1024 * 1024;

/// Key/value blob store the recording pipeline talks to
#[derive(Clone, Debug)]
pub struct BlobStore {
    op: Operator,
}

impl BlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self::new(init_operator(config).await?))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn supports_append(&self) -> bool {
        self.op.info().full_capability().write_can_append
    }

    pub fn supports_presign(&self) -> bool {
        self.op.info().full_capability().presign_read
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let buf = self
            .op
            .read(key)
            .await
            .with_context(|| format!("read {}", key))?;
        Ok(buf.to_vec())
    }

    /// `None` when the key does not exist
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.op.read(key).await {
            Ok(buf) => {
                let value = serde_json::from_slice(&buf.to_vec())
                    .with_context(|| format!("parse {}", key))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("read {}", key))),
        }
    }

    pub async fn put(&self, key: &str, bytes: impl Into<Buffer>) -> Result<()> {
        self.op
            .write(key, bytes.into())
            .await
            .with_context(|| format!("write {}", key))?;
        Ok(())
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        self.put(key, json).await
    }

    /// Read `length` bytes starting at `offset`, short at end of object
    pub async fn range_get(&self, key: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let buf = self
            .op
            .read_with(key)
            .range(offset..offset + length)
            .await
            .with_context(|| format!("range read {} @{}+{}", key, offset, length))?;
        Ok(buf.to_vec())
    }

    /// Object size, `None` when missing
    pub async fn stat(&self, key: &str) -> Result<Option<u64>> {
        match self.op.stat(key).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("stat {}", key))),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.op
            .delete(key)
            .await
            .with_context(|| format!("delete {}", key))
    }

    /// Names of the directories directly below `prefix` (which ends in `/`)
    pub async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = match self.op.list(prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("list {}", prefix))),
        };
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.metadata().is_dir() && entry.path() != prefix)
            .map(|entry| entry.name().trim_end_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn writer(&self, key: &str) -> Result<Writer> {
        self.op
            .writer_with(key)
            .chunk(WRITER_CHUNK)
            .await
            .with_context(|| format!("open writer {}", key))
    }

    /// Start a growing object at `key`, truncating whatever was there
    pub async fn appender(&self, key: &str, head: Vec<u8>) -> Result<Appender> {
        let written = head.len() as u64;
        if self.supports_append() {
            self.put(key, head).await?;
            Ok(Appender::Native {
                op: self.op.clone(),
                key: key.to_string(),
                written,
            })
        } else {
            let mut writer = self.writer(key).await?;
            writer.write(head).await?;
            Ok(Appender::Buffered {
                writer: Box::new(writer),
                key: key.to_string(),
                written,
            })
        }
    }

    /// Presigned GET url when the backend can sign
    pub async fn presign_read(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        if !self.supports_presign() {
            return Ok(None);
        }
        let req = self
            .op
            .presign_read(key, ttl)
            .await
            .with_context(|| format!("presign {}", key))?;
        Ok(Some(req.uri().to_string()))
    }
}

/// Handle on an object that grows while a recording runs.
///
/// Backends with native append see every chunk as soon as it is written.
/// Others get a multipart writer that becomes visible on `close`.
pub enum Appender {
    Native {
        op: Operator,
        key: String,
        written: u64,
    },
    Buffered {
        writer: Box<Writer>,
        key: String,
        written: u64,
    },
}

impl Appender {
    pub fn key(&self) -> &str {
        match self {
            Appender::Native { key, .. } | Appender::Buffered { key, .. } => key,
        }
    }

    pub fn written(&self) -> u64 {
        match self {
            Appender::Native { written, .. } | Appender::Buffered { written, .. } => *written,
        }
    }

    pub async fn append(&mut self, bytes: Vec<u8>) -> Result<()> {
        let len = bytes.len() as u64;
        match self {
            Appender::Native { op, key, written } => {
                op.write_with(key, bytes)
                    .append(true)
                    .await
                    .with_context(|| format!("append {}", key))?;
                *written += len;
            }
            Appender::Buffered {
                writer,
                key,
                written,
            } => {
                writer
                    .write(bytes)
                    .await
                    .with_context(|| format!("append {}", key))?;
                *written += len;
            }
        }
        Ok(())
    }

    /// Commit the object and return its final size
    pub async fn close(self) -> Result<u64> {
        match self {
            Appender::Native { written, .. } => Ok(written),
            Appender::Buffered {
                mut writer,
                key,
                written,
            } => {
                writer
                    .close()
                    .await
                    .with_context(|| format!("commit {}", key))?;
                Ok(written)
            }
        }
    }
}
