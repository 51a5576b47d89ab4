use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SinkError {}

/// Outbound broadcast transport. Fire and forget, no delivery ack.
#[async_trait]
pub trait BroadcastSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// A new live stream begins, its bytes start with a fresh header
    async fn restart(&mut self) {}

    async fn close(&mut self) {}
}

pub fn from_config(cfg: &SinkConfig) -> Box<dyn BroadcastSink> {
    match cfg {
        SinkConfig::Null => Box::new(NullSink),
        SinkConfig::Command {
            program,
            args,
            respawn_interval_ms,
        } => Box::new(CommandSink::new(
            program.clone(),
            args.clone(),
            Duration::from_millis(*respawn_interval_ms),
        )),
    }
}

pub struct NullSink;

#[async_trait]
impl BroadcastSink for NullSink {
    async fn write(&mut self, _bytes: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Feeds the stream to a child process on stdin
pub struct CommandSink {
    program: String,
    args: Vec<String>,
    respawn_interval: Duration,
    child: Option<(Child, ChildStdin)>,
    last_spawn: Option<Instant>,
}

impl CommandSink {
    pub fn new(program: String, args: Vec<String>, respawn_interval: Duration) -> Self {
        Self {
            program,
            args,
            respawn_interval,
            child: None,
            last_spawn: None,
        }
    }

    fn spawn(&mut self) -> Result<(), SinkError> {
        if let Some(at) = self.last_spawn {
            if at.elapsed() < self.respawn_interval {
                return Err(SinkError(format!(
                    "{} exited, waiting before respawn",
                    self.program
                )));
            }
        }
        self.last_spawn = Some(Instant::now());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SinkError(format!("spawn {}: {}", self.program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError(format!("{} has no stdin", self.program)))?;
        info!("[sink] spawned {} pid={:?}", self.program, child.id());
        self.child = Some((child, stdin));
        Ok(())
    }

    async fn reap(&mut self) {
        if let Some((mut child, stdin)) = self.child.take() {
            drop(stdin);
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => debug!("[sink] {} exited with {}", self.program, status),
                Err(e) => warn!("[sink] wait {} failed: {}", self.program, e),
            }
        }
    }
}

#[async_trait]
impl BroadcastSink for CommandSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.child.is_none() {
            self.spawn()?;
        }
        let result = match self.child.as_mut() {
            Some((_, stdin)) => stdin.write_all(bytes).await,
            None => return Err(SinkError("no sink process".to_string())),
        };
        if let Err(e) = result {
            self.reap().await;
            return Err(SinkError(format!("write to {}: {}", self.program, e)));
        }
        Ok(())
    }

    async fn restart(&mut self) {
        self.reap().await;
        self.last_spawn = None;
    }

    async fn close(&mut self) {
        self.reap().await;
    }
}
