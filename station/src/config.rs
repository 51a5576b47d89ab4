use std::{env, fs, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;
use auth::OperatorToken;
use serde::{Deserialize, Serialize};
use storage::StorageConfig;

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
    /// Request body ceiling for plain JSON routes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    /// HS256 secret for operator JWTs
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub operators: Vec<OperatorToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Outbound broadcast transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Discard the stream, useful when only recording
    #[default]
    Null,
    /// Pipe the stream into a child process, e.g. ffmpeg pushing to an icecast or rtmp server
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_respawn_interval_ms")]
        respawn_interval_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
    /// Remaining-time thresholds that trigger a warning
    #[serde(default = "default_warn_before_secs")]
    pub warn_before_secs: Vec<u64>,
    /// Stop the recording once the budget is used up
    #[serde(default = "default_true")]
    pub hard_stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// Local working storage for downloads and mixes
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_io_chunk_bytes")]
    pub download_chunk_bytes: u64,
    #[serde(default = "default_io_chunk_bytes")]
    pub upload_chunk_bytes: u64,
    /// Pick up jobs left in `finalizing` by a previous process
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
    #[serde(default = "default_download_url_ttl_secs")]
    pub download_url_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Uploads up to this size may use the single request path
    #[serde(default = "default_single_request_limit_bytes")]
    pub single_request_limit_bytes: u64,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub shows: Vec<ShowEntry>,
    #[serde(default)]
    pub artists: Vec<ArtistEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowEntry {
    pub id: String,
    #[serde(default)]
    pub artists: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistEntry {
    pub id: String,
    #[serde(default)]
    pub tracks: Vec<String>,
}

fn default_http_listen() -> SocketAddr {
    let port = env::var("PORT").unwrap_or(String::from("7700"));
    SocketAddr::from_str(&format!("0.0.0.0:{}", port))
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7700)))
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

fn default_true() -> bool {
    true
}

fn default_respawn_interval_ms() -> u64 {
    2_000
}

fn default_budget_secs() -> u64 {
    60 * 60
}

fn default_warn_before_secs() -> Vec<u64> {
    vec![10 * 60, 5 * 60]
}

fn default_work_dir() -> String {
    env::temp_dir()
        .join("onair-finalize")
        .to_string_lossy()
        .into_owned()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_io_chunk_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_download_url_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_single_request_limit_bytes() -> u64 {
    32 * 1024 * 1024
}

// Stay clear of the 100 MB request ceiling common on CDN proxies
fn default_max_chunk_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_total_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_session_ttl_secs() -> u64 {
    2 * 60 * 60
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            budget_secs: default_budget_secs(),
            warn_before_secs: default_warn_before_secs(),
            hard_stop: true,
        }
    }
}

impl RecordingConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    /// Warning thresholds inside the budget, largest first
    pub fn warnings(&self) -> Vec<Duration> {
        let mut warnings: Vec<u64> = self
            .warn_before_secs
            .iter()
            .copied()
            .filter(|s| *s > 0 && *s < self.budget_secs)
            .collect();
        warnings.sort_unstable_by(|a, b| b.cmp(a));
        warnings.dedup();
        warnings.into_iter().map(Duration::from_secs).collect()
    }
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            download_chunk_bytes: default_io_chunk_bytes(),
            upload_chunk_bytes: default_io_chunk_bytes(),
            resume_on_startup: true,
            download_url_ttl_secs: default_download_url_ttl_secs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            single_request_limit_bytes: default_single_request_limit_bytes(),
            max_chunk_bytes: default_max_chunk_bytes(),
            max_total_bytes: default_max_total_bytes(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> anyhow::Result<Self> {
        let content = match path {
            Some(path) => {
                fs::read_to_string(&path).with_context(|| format!("read config {}", path))?
            }
            None => fs::read_to_string("onair.toml")
                .or(fs::read_to_string("/etc/onair/onair.toml"))
                .unwrap_or_default(),
        };
        let cfg: Self = toml::from_str(&content).context("config parse error")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recording.budget_secs == 0 {
            anyhow::bail!("recording.budget_secs must be greater than zero");
        }
        if self.finalize.retry_attempts == 0 {
            anyhow::bail!("finalize.retry_attempts must be at least 1");
        }
        if self.finalize.download_chunk_bytes == 0 || self.finalize.upload_chunk_bytes == 0 {
            anyhow::bail!("finalize chunk sizes must be greater than zero");
        }
        if self.transfer.max_chunk_bytes == 0 {
            anyhow::bail!("transfer.max_chunk_bytes must be greater than zero");
        }
        if let SinkConfig::Command { program, .. } = &self.sink {
            if program.trim().is_empty() {
                anyhow::bail!("sink.program cannot be empty");
            }
        }
        for show in &self.catalog.shows {
            if !storage::path::validate_segment(&show.id) {
                anyhow::bail!("invalid show id in catalog: {:?}", show.id);
            }
        }
        Ok(())
    }
}
