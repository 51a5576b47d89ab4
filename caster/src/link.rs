//! Stream socket link: the reconnect state machine and the task driving a
//! capture over it.

use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use api::event::{DisconnectReason, ServerMessage, STOP_FRAME};

use crate::backoff::Backoff;
use crate::capture::Capture;
use crate::client::Client;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting { attempt: u32 },
    Live { session_id: String },
    Retrying { attempt: u32, delay: Duration },
    Error { message: String },
}

impl LinkState {
    pub fn is_live(&self) -> bool {
        matches!(self, LinkState::Live { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connect,
    Opened { session_id: String },
    /// Handshake refused; busy and auth failures are not worth retrying
    Rejected { message: String, retryable: bool },
    Dropped,
    Kicked { reason: DisconnectReason },
    Stop,
    RetryElapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    Dial,
    Wait(Duration),
    Hangup,
    Nothing,
}

pub struct Link {
    state: LinkState,
    backoff: Backoff,
}

impl Link {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: LinkState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn handle(&mut self, event: LinkEvent) -> LinkAction {
        let (next, action) = match (&self.state, event) {
            (LinkState::Disconnected | LinkState::Error { .. }, LinkEvent::Connect) => {
                self.backoff.reset();
                (LinkState::Connecting { attempt: 0 }, LinkAction::Dial)
            }
            (LinkState::Connecting { .. }, LinkEvent::Opened { session_id }) => {
                self.backoff.reset();
                (LinkState::Live { session_id }, LinkAction::Nothing)
            }
            (LinkState::Connecting { .. }, LinkEvent::Rejected { message, retryable }) => {
                if retryable {
                    self.retry(message)
                } else {
                    (LinkState::Error { message }, LinkAction::Nothing)
                }
            }
            (LinkState::Connecting { .. } | LinkState::Live { .. }, LinkEvent::Dropped) => {
                self.retry("connection lost".to_string())
            }
            (LinkState::Live { .. }, LinkEvent::Kicked { reason }) => match reason {
                DisconnectReason::Takeover { by } => (
                    LinkState::Error {
                        message: format!("stream taken over by {}", by),
                    },
                    LinkAction::Hangup,
                ),
                DisconnectReason::Stopped { by } => {
                    info!("[link] stream stopped by {}", by);
                    (LinkState::Disconnected, LinkAction::Hangup)
                }
                DisconnectReason::Shutdown => self.retry("server shutting down".to_string()),
            },
            (LinkState::Retrying { attempt, .. }, LinkEvent::RetryElapsed) => (
                LinkState::Connecting { attempt: *attempt },
                LinkAction::Dial,
            ),
            (LinkState::Connecting { .. } | LinkState::Live { .. }, LinkEvent::Stop) => {
                (LinkState::Disconnected, LinkAction::Hangup)
            }
            (LinkState::Retrying { .. }, LinkEvent::Stop) => {
                (LinkState::Disconnected, LinkAction::Nothing)
            }
            (state, event) => {
                debug!("[link] ignoring {:?} while {:?}", event, state);
                return LinkAction::Nothing;
            }
        };
        self.state = next;
        action
    }

    fn retry(&mut self, message: String) -> (LinkState, LinkAction) {
        match self.backoff.next_delay() {
            Some(delay) => (
                LinkState::Retrying {
                    attempt: self.backoff.attempt(),
                    delay,
                },
                LinkAction::Wait(delay),
            ),
            None => (
                LinkState::Error {
                    message: format!(
                        "{}, gave up after {} attempts",
                        message,
                        self.backoff.max_attempts()
                    ),
                },
                LinkAction::Nothing,
            ),
        }
    }
}

/// Handle to a running [`stream`] task
pub struct Streamer {
    pub state: watch::Receiver<LinkState>,
    pub messages: mpsc::Receiver<ServerMessage>,
    stop: CancellationToken,
}

impl Streamer {
    /// Send the stop frame and hang up
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the link settles in `Disconnected` or `Error`
    pub async fn finished(&mut self) -> LinkState {
        loop {
            let state = self.state.borrow_and_update().clone();
            if matches!(state, LinkState::Disconnected | LinkState::Error { .. }) {
                return state;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

const MESSAGE_BUFFER: usize = 64;

/// Stream `capture` over the stream socket, paced to real time, reconnecting
/// per the link rules. Ends when the capture runs dry, on stop or on a
/// terminal link state.
pub fn stream(client: Client, capture: Capture, force: bool, backoff: Backoff) -> Streamer {
    let mut link = Link::new(backoff);
    let action = link.handle(LinkEvent::Connect);
    let (state_tx, state_rx) = watch::channel(link.state().clone());
    let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_BUFFER);
    let stop = CancellationToken::new();
    tokio::spawn(drive(
        client,
        (capture, force),
        link,
        action,
        state_tx,
        msg_tx,
        stop.clone(),
    ));
    Streamer {
        state: state_rx,
        messages: msg_rx,
        stop,
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

enum Outcome {
    Event(LinkEvent),
    Exhausted,
}

async fn drive(
    client: Client,
    (mut capture, force): (Capture, bool),
    mut link: Link,
    mut action: LinkAction,
    state: watch::Sender<LinkState>,
    messages: mpsc::Sender<ServerMessage>,
    stop: CancellationToken,
) {
    let mut socket: Option<Socket> = None;
    loop {
        let event = match action {
            LinkAction::Dial => match dial(&client, force).await {
                Ok((ws, session_id)) => {
                    capture.restart();
                    socket = Some(ws);
                    LinkEvent::Opened { session_id }
                }
                Err(rejected) => rejected,
            },
            LinkAction::Wait(delay) => {
                tokio::select! {
                    _ = sleep(delay) => LinkEvent::RetryElapsed,
                    _ = stop.cancelled() => LinkEvent::Stop,
                }
            }
            LinkAction::Hangup => {
                if let Some(mut ws) = socket.take() {
                    let _ = ws.send(Message::Text(STOP_FRAME.to_string())).await;
                    let _ = ws.close(None).await;
                }
                break;
            }
            LinkAction::Nothing => match socket.as_mut() {
                Some(ws) if link.state().is_live() => {
                    match pump(ws, &mut capture, &messages, &stop).await {
                        Outcome::Event(event) => {
                            if event == LinkEvent::Dropped {
                                socket = None;
                            }
                            event
                        }
                        Outcome::Exhausted => {
                            info!("[link] capture finished");
                            LinkEvent::Stop
                        }
                    }
                }
                _ => break,
            },
        };
        action = link.handle(event);
        let _ = state.send(link.state().clone());
    }
    debug!("[link] driver done in {:?}", link.state());
}

async fn dial(client: &Client, force: bool) -> std::result::Result<(Socket, String), LinkEvent> {
    let request = client.stream_ws(force).map_err(|e| LinkEvent::Rejected {
        message: e.to_string(),
        retryable: false,
    })?;
    let (mut ws, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(ok) => ok,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            return Err(LinkEvent::Rejected {
                message: format!("{}: {}", status, body),
                retryable: status.is_server_error(),
            });
        }
        Err(e) => {
            warn!("[link] connect failed: {}", e);
            return Err(LinkEvent::Dropped);
        }
    };
    // the server greets every accepted socket first
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(ServerMessage::Connected {
                    session_id,
                    replaced,
                    ..
                }) = serde_json::from_str(&text)
                {
                    if replaced {
                        info!("[link] replaced a previous session");
                    }
                    return Ok((ws, session_id));
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            _ => break,
        }
    }
    Err(LinkEvent::Dropped)
}

/// Send capture chunks no faster than real time, relaying server messages
async fn pump(
    ws: &mut Socket,
    capture: &mut Capture,
    messages: &mpsc::Sender<ServerMessage>,
    stop: &CancellationToken,
) -> Outcome {
    let block = Duration::from_millis(capture.block_ms().max(1));
    let mut due = Instant::now();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Outcome::Event(LinkEvent::Stop),
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Disconnected { reason }) => {
                        let _ = messages.try_send(ServerMessage::Disconnected { reason: reason.clone() });
                        return Outcome::Event(LinkEvent::Kicked { reason });
                    }
                    Ok(msg) => {
                        let _ = messages.try_send(msg);
                    }
                    Err(e) => debug!("[link] unknown server frame {}: {}", text, e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Outcome::Event(LinkEvent::Dropped)
                }
                Some(Ok(_)) => {}
            },
            _ = tokio::time::sleep_until(due) => {
                let chunks = match capture.step() {
                    Ok(Some(chunks)) => chunks,
                    Ok(None) => return Outcome::Exhausted,
                    Err(e) => {
                        warn!("[link] capture failed: {:#}", e);
                        return Outcome::Exhausted;
                    }
                };
                for chunk in chunks {
                    if let Err(e) = send_chunk(ws, chunk).await {
                        warn!("[link] send failed: {}", e);
                        return Outcome::Event(LinkEvent::Dropped);
                    }
                }
                due += block;
            }
        }
    }
}

async fn send_chunk(ws: &mut Socket, chunk: Vec<u8>) -> Result<()> {
    ws.send(Message::Binary(chunk)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(max_attempts: u32) -> Link {
        Link::new(Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            max_attempts,
        ))
    }

    fn live(link: &mut Link) {
        assert_eq!(link.handle(LinkEvent::Connect), LinkAction::Dial);
        link.handle(LinkEvent::Opened {
            session_id: "s1".to_string(),
        });
        assert!(link.state().is_live());
    }

    #[test]
    fn test_drop_retries_with_backoff_then_errors() {
        let mut l = link(2);
        live(&mut l);
        assert_eq!(
            l.handle(LinkEvent::Dropped),
            LinkAction::Wait(Duration::from_millis(100))
        );
        assert_eq!(l.handle(LinkEvent::RetryElapsed), LinkAction::Dial);
        assert_eq!(l.state(), &LinkState::Connecting { attempt: 1 });
        assert_eq!(
            l.handle(LinkEvent::Dropped),
            LinkAction::Wait(Duration::from_millis(200))
        );
        l.handle(LinkEvent::RetryElapsed);
        assert_eq!(l.handle(LinkEvent::Dropped), LinkAction::Nothing);
        assert!(matches!(l.state(), LinkState::Error { .. }));
    }

    #[test]
    fn test_reopening_resets_backoff() {
        let mut l = link(1);
        live(&mut l);
        l.handle(LinkEvent::Dropped);
        l.handle(LinkEvent::RetryElapsed);
        l.handle(LinkEvent::Opened {
            session_id: "s2".to_string(),
        });
        assert_eq!(
            l.handle(LinkEvent::Dropped),
            LinkAction::Wait(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_takeover_is_terminal() {
        let mut l = link(3);
        live(&mut l);
        let action = l.handle(LinkEvent::Kicked {
            reason: DisconnectReason::Takeover {
                by: "bob".to_string(),
            },
        });
        assert_eq!(action, LinkAction::Hangup);
        assert_eq!(
            l.state(),
            &LinkState::Error {
                message: "stream taken over by bob".to_string()
            }
        );
        // no automatic reconnect
        assert_eq!(l.handle(LinkEvent::RetryElapsed), LinkAction::Nothing);
    }

    #[test]
    fn test_admin_stop_and_shutdown() {
        let mut l = link(3);
        live(&mut l);
        l.handle(LinkEvent::Kicked {
            reason: DisconnectReason::Stopped {
                by: "admin".to_string(),
            },
        });
        assert_eq!(l.state(), &LinkState::Disconnected);

        live(&mut l);
        assert!(matches!(
            l.handle(LinkEvent::Kicked {
                reason: DisconnectReason::Shutdown
            }),
            LinkAction::Wait(_)
        ));
    }

    #[test]
    fn test_busy_rejection_is_not_retried() {
        let mut l = link(3);
        l.handle(LinkEvent::Connect);
        l.handle(LinkEvent::Rejected {
            message: "409 busy".to_string(),
            retryable: false,
        });
        assert!(matches!(l.state(), LinkState::Error { .. }));
        // a user can try again from the error state
        assert_eq!(l.handle(LinkEvent::Connect), LinkAction::Dial);
    }

    #[test]
    fn test_stop_while_waiting() {
        let mut l = link(3);
        live(&mut l);
        l.handle(LinkEvent::Dropped);
        assert_eq!(l.handle(LinkEvent::Stop), LinkAction::Nothing);
        assert_eq!(l.state(), &LinkState::Disconnected);
    }
}
