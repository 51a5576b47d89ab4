use std::collections::BTreeMap;

use api::event::{FinalizePhase, FinalizeProgress};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A storage object fetched into the job's work dir
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub size: u64,
    /// File name inside the work dir
    pub file: String,
}

/// One marker rendered to an overlay file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    /// Position in offset order
    pub index: usize,
    pub start_frame: u64,
    pub frames: u64,
    pub file: String,
}

/// Persisted after every finished sub-step of a finalize job.
///
/// Resume decisions only look at what is recorded here, never at leftover
/// files, so a crash between doing a step and saving it redoes that step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub show_id: String,
    pub version: String,
    pub phase: FinalizePhase,
    pub percent: u8,
    pub detail: String,
    #[serde(default)]
    pub downloads: BTreeMap<String, Download>,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
    #[serde(default)]
    pub rendered: bool,
    #[serde(default)]
    pub rendered_frames: u64,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(show_id: &str, version: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            show_id: show_id.to_string(),
            version: version.to_string(),
            phase: FinalizePhase::Downloading,
            percent: 0,
            detail: "queued".to_string(),
            downloads: BTreeMap::new(),
            total_bytes: 0,
            overlays: Vec::new(),
            rendered: false,
            rendered_frames: 0,
            uploaded: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Where work continues given what is recorded as done
    pub fn resume_phase(&self, inputs: usize) -> FinalizePhase {
        if self.uploaded {
            FinalizePhase::Complete
        } else if self.rendered {
            FinalizePhase::Uploading
        } else if self.downloads.len() >= inputs && inputs > 0 {
            FinalizePhase::Merging
        } else {
            FinalizePhase::Downloading
        }
    }

    pub fn is_overlay_done(&self, index: usize) -> bool {
        self.overlays.iter().any(|o| o.index == index)
    }

    pub fn progress(&self, resumed: bool) -> FinalizeProgress {
        FinalizeProgress {
            show_id: self.show_id.clone(),
            version: self.version.clone(),
            phase: self.phase,
            percent: self.percent,
            detail: self.detail.clone(),
            resumed,
        }
    }
}
