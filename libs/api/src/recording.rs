use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which slot of an artist's material a marker points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    VoiceMessage,
    Track1,
    Track2,
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackType::VoiceMessage => write!(f, "voice_message"),
            TrackType::Track1 => write!(f, "track1"),
            TrackType::Track2 => write!(f, "track2"),
        }
    }
}

impl FromStr for TrackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice_message" => Ok(TrackType::VoiceMessage),
            "track1" => Ok(TrackType::Track1),
            "track2" => Ok(TrackType::Track2),
            other => Err(format!("unknown track type: {}", other)),
        }
    }
}

/// A pre-recorded track played during a live recording.
///
/// Overlay `track_key` onto the base capture starting at `offset_ms`
/// for `duration_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub artist_id: String,
    pub track_type: TrackType,
    pub track_key: String,
    pub duration_ms: u64,
    pub offset_ms: u64,
}

/// Drop markers that start after `duration_ms` and cut the rest down to
/// it. Returns how many are left.
pub fn keep_within(markers: &mut Vec<Marker>, duration_ms: u64) -> usize {
    markers.retain(|m| m.offset_ms <= duration_ms);
    for marker in markers.iter_mut() {
        marker.duration_ms = marker.duration_ms.min(duration_ms);
    }
    markers.len()
}

/// Version lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Still capturing, no raw file committed yet
    Recording,
    Raw,
    Finalizing,
    Finalized,
    Failed,
}

impl VersionStatus {
    pub fn can_transition(self, to: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, to),
            (Recording, Raw)
                | (Recording, Failed)
                | (Raw, Finalizing)
                | (Failed, Finalizing)
                | (Finalizing, Finalizing)
                | (Finalizing, Finalized)
                | (Finalizing, Failed)
        )
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionStatus::Recording => "recording",
            VersionStatus::Raw => "raw",
            VersionStatus::Finalizing => "finalizing",
            VersionStatus::Finalized => "finalized",
            VersionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Queryable summary of one `(show_id, version)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingVersionInfo {
    pub show_id: String,
    pub version: String,
    pub status: VersionStatus,
    pub marker_count: usize,
    pub duration_ms: u64,
    /// Milliseconds since epoch
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub needs_inspection: bool,
}

/// What a client needs to rebuild its recording view after a reload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingState {
    pub is_recording: bool,
    pub show_id: Option<String>,
    pub version: Option<String>,
    /// Milliseconds since epoch
    pub started_at: Option<i64>,
    pub elapsed_ms: u64,
    pub marker_count: usize,
    pub budget_ms: u64,
    pub remaining_ms: Option<u64>,
}
