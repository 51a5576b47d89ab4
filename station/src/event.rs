use api::event::{DisconnectReason, ServerMessage};
use api::recording::VersionStatus;

/// Things the live operator should hear about
#[derive(Clone, Debug)]
pub enum StudioEvent {
    StreamUp {
        operator: String,
    },
    StreamDown {
        operator: String,
        reason: Option<DisconnectReason>,
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
        status: VersionStatus,
    },
    RecordingFailed {
        show_id: String,
        version: String,
        message: String,
    },
    /// Writing the raw capture failed, the recording cannot continue
    TapFailed {
        version: String,
        message: String,
    },
    BudgetWarning {
        version: String,
        remaining_ms: u64,
    },
}

impl StudioEvent {
    /// Socket frame for the live operator, if any
    pub fn to_message(&self) -> Option<ServerMessage> {
        match self.clone() {
            StudioEvent::SinkError { message } => Some(ServerMessage::SinkError { message }),
            StudioEvent::SinkRecovered => Some(ServerMessage::SinkRecovered),
            StudioEvent::RecordingStarted { show_id, version } => {
                Some(ServerMessage::RecordingStarted { show_id, version })
            }
            StudioEvent::RecordingStopped {
                show_id,
                version,
                status,
            } => Some(ServerMessage::RecordingStopped {
                show_id,
                version,
                status: status.to_string(),
            }),
            StudioEvent::RecordingFailed {
                show_id,
                version,
                message,
            } => Some(ServerMessage::RecordingFailed {
                show_id,
                version,
                message,
            }),
            StudioEvent::BudgetWarning { remaining_ms, .. } => {
                Some(ServerMessage::BudgetWarning { remaining_ms })
            }
            StudioEvent::StreamUp { .. }
            | StudioEvent::StreamDown { .. }
            | StudioEvent::TapFailed { .. } => None,
        }
    }
}
