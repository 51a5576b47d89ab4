use serde::{Deserialize, Serialize};

/// Where recordings, tracks and staged uploads live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage
    Fs {
        #[serde(default = "default_fs_root")]
        root: String,
        /// Stage whole-object writes here and rename into place
        #[serde(default)]
        atomic_write_dir: Option<String>,
    },
    /// AWS S3 compatible storage
    S3 {
        bucket: String,
        #[serde(default = "default_bucket_root")]
        root: String,
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint for S3-compatible services
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default)]
        session_token: Option<String>,
        /// Disable config/credential auto-loading
        #[serde(default)]
        disable_config_load: bool,
        #[serde(default)]
        enable_virtual_host_style: bool,
    },
    /// Alibaba Cloud OSS, spoken to through its S3 compatible API
    Oss {
        bucket: String,
        #[serde(default = "default_bucket_root")]
        root: String,
        region: String,
        endpoint: String,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        access_key_secret: Option<String>,
        /// Security token for STS
        #[serde(default)]
        security_token: Option<String>,
    },
}

impl StorageConfig {
    pub fn fs<T: ToString>(root: T) -> Self {
        Self::Fs {
            root: root.to_string(),
            atomic_write_dir: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageConfig::Fs { .. } => "fs",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::Oss { .. } => "oss",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::fs(default_fs_root())
    }
}

fn default_fs_root() -> String {
    "./storage".to_string()
}

fn default_bucket_root() -> String {
    "/".to_string()
}
