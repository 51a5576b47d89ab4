#![allow(dead_code)]

use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use api::event::ServerMessage;
use api::wav::StreamFormat;
use caster::{Client, Credentials};
use station::config::Config;
use storage::StorageConfig;

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const FORMAT: StreamFormat = StreamFormat {
    sample_rate: 8_000,
    channels: 1,
    bits_per_sample: 16,
};

pub struct Station {
    pub addr: SocketAddr,
    pub dir: TempDir,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub async fn start() -> Station {
    start_with(|_| {}).await
}

pub async fn start_with(f: impl FnOnce(&mut Config)) -> Station {
    let dir = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.storage = StorageConfig::fs(dir.path().join("store").display());
    cfg.finalize.work_dir = dir.path().join("work").display().to_string();
    cfg.finalize.retry_base_ms = 1;
    f(&mut cfg);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(station::serve(cfg, listener, async {
        let _ = rx.await;
    }));
    Station {
        addr,
        dir,
        stop: Some(tx),
        handle,
    }
}

impl Station {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client for a station running without authentication
    pub fn client(&self, operator: &str) -> Client {
        Client::new(
            self.url(),
            Credentials {
                token: None,
                operator: Some(operator.to_string()),
            },
        )
        .unwrap()
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), &mut self.handle)
            .await
            .expect("station did not stop")
            .unwrap()
            .unwrap();
    }
}

/// `ms` of constant 16-bit PCM at [`FORMAT`]
pub fn pcm(ms: u64, value: i16) -> Vec<u8> {
    let frames = FORMAT.frames_for_ms(ms) as usize;
    let mut out = Vec::with_capacity(frames * 2);
    for _ in 0..frames {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// A complete WAV file at [`FORMAT`]
pub fn wav(ms: u64, value: i16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: FORMAT.channels,
        sample_rate: FORMAT.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
    for _ in 0..FORMAT.frames_for_ms(ms) {
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
    bytes
}

pub async fn open_stream(client: &Client, force: bool) -> (Socket, ServerMessage) {
    let (mut ws, _) = tokio_tungstenite::connect_async(client.stream_ws(force).unwrap())
        .await
        .unwrap();
    let connected = next_message(&mut ws).await;
    assert!(matches!(connected, ServerMessage::Connected { .. }));
    (ws, connected)
}

/// Next server text frame, skipping anything else
pub async fn next_message(ws: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no server message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read frames until `want` matches one
pub async fn wait_message(ws: &mut Socket, want: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    loop {
        let msg = next_message(ws).await;
        if want(&msg) {
            return msg;
        }
    }
}
