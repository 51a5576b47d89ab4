//! Single-writer live stream relay.
//!
//! One operator at a time owns the stream. Bytes go unchanged to the
//! broadcast sink and, while a recording runs, whole PCM frames go to the
//! raw tap as well.

use std::sync::RwLock;

use api::event::DisconnectReason;
use api::response::StreamStatus;
use api::wav::{parse_header, HeaderParse};
use chrono::Utc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::StreamFormat;
use crate::error::AppError;
use crate::event::StudioEvent;
use crate::result::Result;

pub mod sink;
pub mod tap;

pub use sink::BroadcastSink;
pub use tap::{RawTap, TapSummary};

/// Proof of stream ownership, presented on every send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: Uuid,
    pub operator: String,
}

pub struct Opened {
    pub handle: SessionHandle,
    /// Fires when the session is ended by someone else
    pub disconnected: oneshot::Receiver<DisconnectReason>,
    /// Operator whose session was closed to make room
    pub replaced: Option<String>,
}

struct Live {
    handle: SessionHandle,
    notify: Option<oneshot::Sender<DisconnectReason>>,
    head: Vec<u8>,
    format: Option<StreamFormat>,
    remainder: Vec<u8>,
}

impl Live {
    fn kick(&mut self, reason: DisconnectReason) {
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(reason);
        }
    }

    /// Split incoming bytes into header and PCM, returns frame aligned PCM
    fn pcm(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut pcm = match self.format {
            Some(_) => bytes.to_vec(),
            None => {
                self.head.extend_from_slice(bytes);
                match parse_header(&self.head) {
                    Ok(HeaderParse::Incomplete) => return Ok(Vec::new()),
                    Ok(HeaderParse::Ready {
                        format,
                        data_offset,
                    }) => {
                        debug!(
                            "[relay] stream format {}Hz/{}ch from {}",
                            format.sample_rate, format.channels, self.handle.operator
                        );
                        self.format = Some(format);
                        let pcm = self.head.split_off(data_offset);
                        self.head = Vec::new();
                        pcm
                    }
                    Err(e) => {
                        return Err(AppError::bad_request(format!("invalid stream header: {}", e)))
                    }
                }
            }
        };

        let align = match self.format {
            Some(format) => format.block_align(),
            None => return Ok(Vec::new()),
        };
        if !self.remainder.is_empty() {
            let mut joined = std::mem::take(&mut self.remainder);
            joined.extend_from_slice(&pcm);
            pcm = joined;
        }
        let whole = pcm.len() / align * align;
        self.remainder = pcm.split_off(whole);
        Ok(pcm)
    }
}

struct Inner {
    live: Option<Live>,
    tap: Option<RawTap>,
    sink: Box<dyn BroadcastSink>,
    sink_failing: bool,
}

pub struct Relay {
    inner: Mutex<Inner>,
    status: RwLock<StreamStatus>,
    events: broadcast::Sender<StudioEvent>,
}

impl Relay {
    pub fn new(sink: Box<dyn BroadcastSink>, events: broadcast::Sender<StudioEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: None,
                tap: None,
                sink,
                sink_failing: false,
            }),
            status: RwLock::new(StreamStatus::default()),
            events,
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_live(&self) -> bool {
        self.status().active
    }

    fn update_status<F: FnOnce(&mut StreamStatus)>(&self, f: F) {
        if let Ok(mut status) = self.status.write() {
            f(&mut status);
        }
    }

    fn emit(&self, event: StudioEvent) {
        let _ = self.events.send(event);
    }

    /// Cheap pre-flight so a busy stream is refused before the socket upgrade
    pub fn check(&self, operator: &str, force: bool) -> Result<()> {
        let status = self.status();
        match status.user {
            Some(user) if status.active && user != operator && !force => Err(AppError::Busy {
                current_operator: user,
            }),
            _ => Ok(()),
        }
    }

    /// Claim the stream.
    ///
    /// The operator's own stale session is replaced silently, a different
    /// operator's session only with `force`.
    pub async fn open(&self, operator: &str, force: bool) -> Result<Opened> {
        let mut inner = self.inner.lock().await;
        let mut replaced = None;
        if let Some(live) = inner.live.as_ref() {
            if live.handle.operator != operator && !force {
                return Err(AppError::Busy {
                    current_operator: live.handle.operator.clone(),
                });
            }
        }
        if let Some(mut old) = inner.live.take() {
            let reason = DisconnectReason::Takeover {
                by: operator.to_string(),
            };
            info!(
                "[relay] {} takes over the stream from {}",
                operator, old.handle.operator
            );
            old.kick(reason.clone());
            self.emit(StudioEvent::StreamDown {
                operator: old.handle.operator.clone(),
                reason: Some(reason),
            });
            replaced = Some(old.handle.operator);
        }

        let (tx, rx) = oneshot::channel();
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            operator: operator.to_string(),
        };
        let since = Utc::now();
        inner.sink.restart().await;
        inner.sink_failing = false;
        inner.live = Some(Live {
            handle: handle.clone(),
            notify: Some(tx),
            head: Vec::new(),
            format: None,
            remainder: Vec::new(),
        });
        drop(inner);

        self.update_status(|s| {
            *s = StreamStatus {
                active: true,
                user: Some(operator.to_string()),
                since: Some(since.timestamp_millis()),
                sink_error: None,
            }
        });
        info!("[relay] stream live by {} session={}", operator, handle.id);
        self.emit(StudioEvent::StreamUp {
            operator: operator.to_string(),
        });
        Ok(Opened {
            handle,
            disconnected: rx,
            replaced,
        })
    }

    /// Forward one capture chunk. Sink failures never end the session.
    pub async fn send(&self, handle: &SessionHandle, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let Inner {
            live,
            tap,
            sink,
            sink_failing,
        } = &mut *guard;
        let live = match live.as_mut() {
            Some(live) if live.handle.id == handle.id => live,
            _ => return Err(AppError::SessionClosed),
        };
        let pcm = live.pcm(bytes)?;

        match sink.write(bytes).await {
            Ok(()) => {
                if *sink_failing {
                    *sink_failing = false;
                    info!("[relay] broadcast sink recovered");
                    self.update_status(|s| s.sink_error = None);
                    self.emit(StudioEvent::SinkRecovered);
                }
            }
            Err(e) => {
                if !*sink_failing {
                    *sink_failing = true;
                    warn!("[relay] broadcast sink error: {}", e);
                    self.emit(StudioEvent::SinkError {
                        message: e.to_string(),
                    });
                }
                self.update_status(|s| s.sink_error = Some(e.to_string()));
            }
        }

        if let (Some(tap), Some(format)) = (tap.as_mut(), live.format) {
            if let Err(e) = tap.write(live.handle.id, format, &pcm).await {
                self.emit(StudioEvent::TapFailed {
                    version: tap.version.clone(),
                    message: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }

    /// End the caller's own session
    pub async fn close(&self, handle: &SessionHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.live.as_ref() {
            Some(live) if live.handle.id == handle.id => {}
            _ => return Err(AppError::SessionClosed),
        }
        inner.live = None;
        inner.sink.close().await;
        drop(inner);

        self.update_status(|s| *s = StreamStatus::default());
        info!("[relay] stream closed by {}", handle.operator);
        self.emit(StudioEvent::StreamDown {
            operator: handle.operator.clone(),
            reason: None,
        });
        Ok(())
    }

    /// Close whatever session is live, returns its operator
    pub async fn stop(&self, by: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let mut live = inner.live.take().ok_or(AppError::NotLive)?;
        let reason = DisconnectReason::Stopped { by: by.to_string() };
        live.kick(reason.clone());
        inner.sink.close().await;
        drop(inner);

        self.update_status(|s| *s = StreamStatus::default());
        info!("[relay] stream of {} stopped by {}", live.handle.operator, by);
        self.emit(StudioEvent::StreamDown {
            operator: live.handle.operator.clone(),
            reason: Some(reason),
        });
        Ok(live.handle.operator)
    }

    /// Start copying the live PCM into `tap`. Needs a live stream.
    pub async fn begin_tap(&self, mut tap: RawTap) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.tap.as_ref() {
            return Err(AppError::AlreadyRecording(current.version.clone()));
        }
        let live = inner.live.as_ref().ok_or(AppError::NotLive)?;
        if let Some(format) = live.format {
            tap.prime(live.handle.id, format)
                .await
                .map_err(AppError::storage)?;
        }
        info!("[relay] raw capture started at {}", tap.key);
        inner.tap = Some(tap);
        Ok(())
    }

    /// Detach and commit the tap for `version`
    pub async fn end_tap(&self, version: &str) -> Option<TapSummary> {
        let mut inner = self.inner.lock().await;
        match inner.tap.as_ref() {
            Some(tap) if tap.version == version => {}
            _ => return None,
        }
        let tap = inner.tap.take()?;
        drop(inner);
        let summary = tap.finish().await;
        info!(
            "[relay] raw capture {} closed, {} bytes",
            summary.key, summary.bytes
        );
        Some(summary)
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut live) = inner.live.take() {
            live.kick(DisconnectReason::Shutdown);
        }
        if let Some(tap) = inner.tap.take() {
            let summary = tap.finish().await;
            warn!("[relay] raw capture {} closed by shutdown", summary.key);
        }
        inner.sink.close().await;
        drop(inner);
        self.update_status(|s| *s = StreamStatus::default());
    }
}
