use serde::{Deserialize, Serialize};

use crate::recording::VersionStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStatus {
    pub active: bool,
    pub user: Option<String>,
    /// Milliseconds since epoch
    pub since: Option<i64>,
    pub sink_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStarted {
    pub show_id: String,
    pub version: String,
    pub raw_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStopped {
    pub show_id: String,
    pub version: String,
    pub raw_key: String,
    pub status: VersionStatus,
    pub duration_ms: u64,
    pub marker_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerAdded {
    pub index: usize,
    pub offset_ms: u64,
    pub marker_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    pub session_id: String,
    pub max_chunk_bytes: u64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAccepted {
    pub session_id: String,
    pub index: u32,
    pub next_index: u32,
    pub received_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferComplete {
    pub final_key: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// JSON body of every non-2xx response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}
