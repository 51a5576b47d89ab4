//! Finalize progress subscriber with automatic reconnect.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use api::event::{FinalizePhase, FinalizeProgress};

use crate::backoff::Backoff;
use crate::client::Client;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressState {
    Idle,
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32 },
    Complete,
    Failed { message: String },
    Error { message: String },
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressState::Complete | ProgressState::Failed { .. } | ProgressState::Error { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Start,
    Opened,
    Rejected { message: String },
    Progress(FinalizeProgress),
    Dropped,
    RetryElapsed,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressAction {
    /// `watch` attaches to the existing job instead of starting one
    Dial { watch: bool },
    Wait(Duration),
    Hangup,
    Nothing,
}

pub struct ProgressMachine {
    state: ProgressState,
    backoff: Backoff,
    last: Option<FinalizeProgress>,
}

impl ProgressMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ProgressState::Idle,
            backoff,
            last: None,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Most recent progress seen on any connection
    pub fn last(&self) -> Option<&FinalizeProgress> {
        self.last.as_ref()
    }

    pub fn handle(&mut self, event: ProgressEvent) -> ProgressAction {
        use ProgressState as S;
        let (next, action) = match (&self.state, event) {
            (S::Idle, ProgressEvent::Start) => {
                self.backoff.reset();
                (S::Connecting, ProgressAction::Dial { watch: false })
            }
            (S::Connecting, ProgressEvent::Opened) => {
                self.backoff.reset();
                (S::Subscribed, ProgressAction::Nothing)
            }
            (S::Connecting, ProgressEvent::Rejected { message }) => {
                (S::Error { message }, ProgressAction::Nothing)
            }
            (S::Connecting | S::Subscribed, ProgressEvent::Progress(progress)) => {
                let next = match progress.phase {
                    FinalizePhase::Complete => (S::Complete, ProgressAction::Hangup),
                    FinalizePhase::Error => (
                        S::Failed {
                            message: progress.detail.clone(),
                        },
                        ProgressAction::Hangup,
                    ),
                    _ => (S::Subscribed, ProgressAction::Nothing),
                };
                self.last = Some(progress);
                next
            }
            (S::Connecting | S::Subscribed, ProgressEvent::Dropped) => {
                match self.backoff.next_delay() {
                    Some(delay) => (
                        S::Reconnecting {
                            attempt: self.backoff.attempt(),
                        },
                        ProgressAction::Wait(delay),
                    ),
                    None => (
                        S::Error {
                            message: format!(
                                "progress channel lost after {} reconnect attempts",
                                self.backoff.max_attempts()
                            ),
                        },
                        ProgressAction::Nothing,
                    ),
                }
            }
            (S::Reconnecting { .. }, ProgressEvent::RetryElapsed) => {
                (S::Connecting, ProgressAction::Dial { watch: true })
            }
            (state, ProgressEvent::Cancel) if !state.is_terminal() => {
                (S::Idle, ProgressAction::Hangup)
            }
            (state, event) => {
                debug!("[progress] ignoring {:?} while {:?}", event, state);
                return ProgressAction::Nothing;
            }
        };
        self.state = next;
        action
    }
}

/// Handle to a running [`follow`] task
pub struct Subscriber {
    pub state: watch::Receiver<ProgressState>,
    pub updates: mpsc::Receiver<FinalizeProgress>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Stop listening; the job on the server keeps running
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn finished(&mut self) -> ProgressState {
        loop {
            let state = self.state.borrow_and_update().clone();
            if state.is_terminal() || state == ProgressState::Idle {
                return state;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

const UPDATE_BUFFER: usize = 64;

/// Start (or attach to) finalizing `show_id/version` and follow its progress
pub fn follow(client: Client, show_id: &str, version: &str, backoff: Backoff) -> Subscriber {
    let mut machine = ProgressMachine::new(backoff);
    let action = machine.handle(ProgressEvent::Start);
    let (state_tx, state_rx) = watch::channel(machine.state().clone());
    let (update_tx, update_rx) = mpsc::channel(UPDATE_BUFFER);
    let cancel = CancellationToken::new();
    tokio::spawn(drive(
        client,
        (show_id.to_string(), version.to_string()),
        machine,
        action,
        state_tx,
        update_tx,
        cancel.clone(),
    ));
    Subscriber {
        state: state_rx,
        updates: update_rx,
        cancel,
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn drive(
    client: Client,
    (show_id, version): (String, String),
    mut machine: ProgressMachine,
    mut action: ProgressAction,
    state: watch::Sender<ProgressState>,
    updates: mpsc::Sender<FinalizeProgress>,
    cancel: CancellationToken,
) {
    let mut socket: Option<Socket> = None;
    loop {
        let event = match action {
            ProgressAction::Dial { watch } => {
                let request = match client.finalize_ws(&show_id, &version, watch) {
                    Ok(request) => request,
                    Err(e) => {
                        machine.handle(ProgressEvent::Rejected {
                            message: e.to_string(),
                        });
                        let _ = state.send(machine.state().clone());
                        break;
                    }
                };
                if watch {
                    info!("[progress] reattaching to {}/{}", show_id, version);
                }
                match tokio_tungstenite::connect_async(request).await {
                    Ok((ws, _)) => {
                        socket = Some(ws);
                        ProgressEvent::Opened
                    }
                    Err(tungstenite::Error::Http(response)) if response.status().is_client_error() => {
                        ProgressEvent::Rejected {
                            message: format!("finalize channel refused: {}", response.status()),
                        }
                    }
                    Err(e) => {
                        warn!("[progress] connect failed: {}", e);
                        ProgressEvent::Dropped
                    }
                }
            }
            ProgressAction::Wait(delay) => {
                tokio::select! {
                    _ = sleep(delay) => ProgressEvent::RetryElapsed,
                    _ = cancel.cancelled() => ProgressEvent::Cancel,
                }
            }
            ProgressAction::Hangup => {
                if let Some(mut ws) = socket.take() {
                    let _ = ws.close(None).await;
                }
                break;
            }
            ProgressAction::Nothing => match socket.as_mut() {
                Some(ws) if *machine.state() == ProgressState::Subscribed => {
                    tokio::select! {
                        _ = cancel.cancelled() => ProgressEvent::Cancel,
                        frame = ws.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<FinalizeProgress>(&text) {
                                    Ok(progress) => {
                                        let _ = updates.try_send(progress.clone());
                                        ProgressEvent::Progress(progress)
                                    }
                                    Err(e) => {
                                        debug!("[progress] unknown frame {}: {}", text, e);
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                socket = None;
                                ProgressEvent::Dropped
                            }
                            Some(Ok(_)) => continue,
                        },
                    }
                }
                _ => break,
            },
        };
        action = machine.handle(event);
        let _ = state.send(machine.state().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(phase: FinalizePhase, percent: u8) -> FinalizeProgress {
        FinalizeProgress {
            show_id: "S".to_string(),
            version: "V1".to_string(),
            phase,
            percent,
            detail: format!("{} {}%", phase, percent),
            resumed: false,
        }
    }

    fn subscribed(max_attempts: u32) -> ProgressMachine {
        let mut m = ProgressMachine::new(Backoff::new(
            Duration::from_millis(250),
            Duration::from_secs(2),
            max_attempts,
        ));
        assert_eq!(m.handle(ProgressEvent::Start), ProgressAction::Dial { watch: false });
        m.handle(ProgressEvent::Opened);
        assert_eq!(m.state(), &ProgressState::Subscribed);
        m
    }

    #[test]
    fn test_runs_to_complete() {
        let mut m = subscribed(3);
        m.handle(ProgressEvent::Progress(progress(FinalizePhase::Merging, 40)));
        assert_eq!(m.state(), &ProgressState::Subscribed);
        assert_eq!(
            m.handle(ProgressEvent::Progress(progress(FinalizePhase::Complete, 100))),
            ProgressAction::Hangup
        );
        assert_eq!(m.state(), &ProgressState::Complete);
        assert_eq!(m.last().unwrap().percent, 100);
    }

    #[test]
    fn test_error_phase_is_failed_with_detail() {
        let mut m = subscribed(3);
        let mut p = progress(FinalizePhase::Error, 0);
        p.detail = "cannot decode artists/A/track1.wav".to_string();
        m.handle(ProgressEvent::Progress(p));
        assert_eq!(
            m.state(),
            &ProgressState::Failed {
                message: "cannot decode artists/A/track1.wav".to_string()
            }
        );
    }

    #[test]
    fn test_reconnect_attaches_with_watch() {
        let mut m = subscribed(3);
        m.handle(ProgressEvent::Progress(progress(FinalizePhase::Downloading, 50)));
        assert_eq!(
            m.handle(ProgressEvent::Dropped),
            ProgressAction::Wait(Duration::from_millis(250))
        );
        assert_eq!(m.state(), &ProgressState::Reconnecting { attempt: 1 });
        assert_eq!(
            m.handle(ProgressEvent::RetryElapsed),
            ProgressAction::Dial { watch: true }
        );
        m.handle(ProgressEvent::Opened);
        m.handle(ProgressEvent::Progress(progress(FinalizePhase::Merging, 10)));
        assert_eq!(m.last().unwrap().phase, FinalizePhase::Merging);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut m = subscribed(3);
        let mut delays = Vec::new();
        loop {
            match m.handle(ProgressEvent::Dropped) {
                ProgressAction::Wait(d) => {
                    delays.push(d);
                    m.handle(ProgressEvent::RetryElapsed);
                }
                ProgressAction::Nothing => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000)
            ]
        );
        assert!(matches!(m.state(), ProgressState::Error { .. }));
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let mut m = subscribed(3);
        assert_eq!(m.handle(ProgressEvent::Cancel), ProgressAction::Hangup);
        assert_eq!(m.state(), &ProgressState::Idle);
    }
}
