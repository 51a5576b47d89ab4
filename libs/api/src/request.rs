use serde::{Deserialize, Serialize};

use crate::recording::{Marker, TrackType};

/// Header naming the operator when authentication is switched off
pub const OPERATOR_HEADER: &str = "x-operator";
/// Query parameter carrying the token for WebSocket upgrades
pub const TOKEN_QUERY: &str = "access_token";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRecording {
    pub show_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddMarker {
    pub artist_id: String,
    pub track_type: TrackType,
    pub track_key: String,
    pub duration_ms: u64,
    /// Relative to recording start; the server clock is used when absent
    #[serde(default)]
    pub offset_ms: Option<i64>,
}

/// Pins marker and stop calls to the recording the client believes is active
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionQuery {
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeQuery {
    /// Attach to an existing job without starting one
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum TransferMetadata {
    /// Raw capture recorded elsewhere, ingested as a new version
    Recording {
        show_id: String,
        #[serde(default)]
        markers: Vec<Marker>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    /// Opaque object stored under `uploads/`
    File { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInit {
    pub total_size: u64,
    pub total_chunks: u32,
    pub metadata: TransferMetadata,
}

/// Multipart field names of the single request upload
pub const SINGLE_METADATA_FIELD: &str = "metadata";
pub const SINGLE_FILE_FIELD: &str = "file";
