use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizePhase {
    Downloading,
    Merging,
    Uploading,
    Complete,
    Error,
}

impl FinalizePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, FinalizePhase::Complete | FinalizePhase::Error)
    }

    /// Position in the pipeline, terminal phases sort last
    pub fn rank(self) -> u8 {
        match self {
            FinalizePhase::Downloading => 0,
            FinalizePhase::Merging => 1,
            FinalizePhase::Uploading => 2,
            FinalizePhase::Complete | FinalizePhase::Error => 3,
        }
    }
}

impl fmt::Display for FinalizePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalizePhase::Downloading => "downloading",
            FinalizePhase::Merging => "merging",
            FinalizePhase::Uploading => "uploading",
            FinalizePhase::Complete => "complete",
            FinalizePhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// One push on the finalize progress channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeProgress {
    pub show_id: String,
    pub version: String,
    pub phase: FinalizePhase,
    /// 0..=100, scoped to `phase`
    pub percent: u8,
    pub detail: String,
    pub resumed: bool,
}

impl FinalizeProgress {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Text frames pushed by the server on the stream socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
        operator: String,
        replaced: bool,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    SinkError {
        message: String,
    },
    SinkRecovered,
    RecordingStarted {
        show_id: String,
        version: String,
    },
    RecordingStopped {
        show_id: String,
        version: String,
        status: String,
    },
    RecordingFailed {
        show_id: String,
        version: String,
        message: String,
    },
    BudgetWarning {
        remaining_ms: u64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectReason {
    Takeover { by: String },
    Stopped { by: String },
    Shutdown,
}

/// Client to server text frame ending the capture
pub const STOP_FRAME: &str = "stop";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_tagging() {
        let msg = ServerMessage::Disconnected {
            reason: DisconnectReason::Takeover {
                by: "bob".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"disconnected","reason":{"kind":"takeover","by":"bob"}}"#
        );
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_phase_order() {
        assert!(FinalizePhase::Downloading.rank() < FinalizePhase::Merging.rank());
        assert!(FinalizePhase::Merging.rank() < FinalizePhase::Uploading.rank());
        assert!(FinalizePhase::Error.is_terminal());
        assert!(!FinalizePhase::Uploading.is_terminal());
    }
}
