use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::time::interval;
use tracing::{error, info, warn};

use api::event::ServerMessage;
use api::recording::{Marker, TrackType};
use api::request::TransferMetadata;
use caster::budget::Countdown;
use caster::capture::{Capture, Gain, WavFileSource};
use caster::link::{self, LinkState};
use caster::progress::{self, ProgressState};
use caster::trigger::{Cue, TriggerController};
use caster::upload::Uploader;
use caster::{Backoff, Client, Credentials};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station base URL
    #[arg(short, long, default_value = "http://localhost:7700")]
    url: String,
    /// WAV file to play as the live input
    #[arg(short, long)]
    file: PathBuf,
    /// Bearer token
    #[arg(long)]
    token: Option<String>,
    /// Operator name for stations running without authentication
    #[arg(long)]
    operator: Option<String>,
    /// Take the stream over from another operator
    #[arg(long)]
    force: bool,
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    gain_db: f32,
    #[arg(long, default_value_t = 16 * 1024)]
    chunk_bytes: usize,
    /// Audio pulled per pacing step
    #[arg(long, default_value_t = 100)]
    block_ms: u64,
    /// Record the stream into this show
    #[arg(short, long)]
    show: Option<String>,
    /// `artist,track_type,track_key,at_ms,duration_ms`; may repeat
    #[arg(long = "cue", value_parser = parse_cue)]
    cues: Vec<CueSpec>,
    /// Upload the file as a recording instead of streaming it
    #[arg(long)]
    upload: bool,
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    single_limit: u64,
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    upload_chunk_bytes: u64,
    /// Finalize the recording afterwards and follow its progress
    #[arg(long)]
    finalize: bool,
    /// Budget warnings, in seconds before the end
    #[arg(long, value_delimiter = ',', default_value = "600,300")]
    warn_before: Vec<u64>,
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(Debug, Clone)]
struct CueSpec {
    artist_id: String,
    track_type: TrackType,
    track_key: String,
    at_ms: u64,
    duration_ms: u64,
}

fn parse_cue(s: &str) -> Result<CueSpec, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [artist_id, track_type, track_key, at_ms, duration_ms] = parts.as_slice() else {
        return Err(format!(
            "expected artist,track_type,track_key,at_ms,duration_ms, got {}",
            s
        ));
    };
    Ok(CueSpec {
        artist_id: artist_id.to_string(),
        track_type: track_type.parse()?,
        track_key: track_key.to_string(),
        at_ms: at_ms.parse().map_err(|e| format!("at_ms: {}", e))?,
        duration_ms: duration_ms
            .parse()
            .map_err(|e| format!("duration_ms: {}", e))?,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    utils::set_log(format!("castfile={},caster={}", args.log, args.log));
    args.cues.sort_by_key(|c| c.at_ms);

    let client = Client::new(
        args.url.clone(),
        Credentials {
            token: args.token.clone(),
            operator: args.operator.clone(),
        },
    )?;

    let version = if args.upload {
        Some(upload(&client, &args).await?)
    } else {
        stream(&client, &args).await?
    };

    if args.finalize {
        match (&args.show, version) {
            (Some(show), Some(version)) => finalize(&client, show, &version).await?,
            _ => warn!("nothing recorded, skipping finalize"),
        }
    }
    Ok(())
}

async fn upload(client: &Client, args: &Args) -> Result<String> {
    let show_id = args
        .show
        .clone()
        .ok_or_else(|| anyhow!("--upload needs --show"))?;
    let data = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("read {}", args.file.display()))?;
    let markers = args
        .cues
        .iter()
        .map(|c| Marker {
            artist_id: c.artist_id.clone(),
            track_type: c.track_type,
            track_key: c.track_key.clone(),
            duration_ms: c.duration_ms,
            offset_ms: c.at_ms,
        })
        .collect();
    let uploader = Uploader::new(
        client.clone(),
        args.single_limit,
        args.upload_chunk_bytes,
        Backoff::default(),
    );
    let done = uploader
        .upload(
            TransferMetadata::Recording {
                show_id,
                markers,
                duration_ms: None,
            },
            &data,
        )
        .await?;
    info!("uploaded {} bytes as {}", done.size, done.final_key);
    done.version
        .ok_or_else(|| anyhow!("station did not register a version"))
}

struct Session {
    version: String,
    trigger: TriggerController,
    countdown: Countdown,
    started_at_ms: i64,
    next_cue: usize,
}

async fn stream(client: &Client, args: &Args) -> Result<Option<String>> {
    let source = WavFileSource::open(&args.file)?;
    info!(
        "streaming {} ({} ms)",
        args.file.display(),
        source.duration_ms()
    );
    let capture = Capture::new(
        Box::new(source),
        Gain::from_db(args.gain_db),
        args.chunk_bytes,
        args.block_ms,
    );
    let mut streamer = link::stream(client.clone(), capture, args.force, Backoff::default());
    let opened = streamer
        .state
        .wait_for(|s| s.is_live() || matches!(s, LinkState::Error { .. }))
        .await
        .map(|s| s.clone());
    match opened {
        Ok(LinkState::Live { session_id }) => info!("live, session {}", session_id),
        Ok(LinkState::Error { message }) => bail!("stream refused: {}", message),
        _ => bail!("stream ended before going live"),
    }

    let mut session = match &args.show {
        Some(show) => {
            let started = client.start_recording(show).await?;
            let state = client.recording_status().await?;
            let mut trigger = TriggerController::new();
            trigger.sync(&state);
            let mut countdown =
                Countdown::new(args.warn_before.iter().map(|s| s * 1000).collect());
            countdown.sync(&state);
            info!("recording {}/{}", show, started.version);
            Some(Session {
                version: started.version,
                trigger,
                countdown,
                started_at_ms: state.started_at.unwrap_or_else(now_ms),
                next_cue: 0,
            })
        }
        None => None,
    };

    let mut ticker = interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            msg = streamer.messages.recv() => match msg {
                Some(ServerMessage::RecordingStopped { version, status, .. }) => {
                    info!("recording {} stopped by the station: {}", version, status);
                    if let Some(s) = session.as_mut() {
                        s.trigger.recording_stopped();
                    }
                }
                Some(ServerMessage::BudgetWarning { remaining_ms }) => {
                    warn!("station: {} s of recording budget left", remaining_ms / 1000);
                }
                Some(msg) => info!("station: {:?}", msg),
                None => {}
            },
            _ = ticker.tick() => {
                if let Some(s) = session.as_mut() {
                    let cues = run_cues(s, &args.cues, now_ms());
                    post(client, cues).await;
                }
            }
            changed = streamer.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = streamer.state.borrow().clone();
                match state {
                    LinkState::Retrying { attempt, delay } => {
                        warn!("link dropped, retry {} in {:?}", attempt, delay)
                    }
                    LinkState::Disconnected => break,
                    LinkState::Error { message } => {
                        error!("link failed: {}", message);
                        break;
                    }
                    _ => {}
                }
            }
            signal = utils::wait_for_stop_signal() => {
                info!("received {}, stopping", signal);
                streamer.stop();
            }
        }
    }
    streamer.finished().await;

    let Some(mut s) = session else {
        return Ok(None);
    };
    if s.trigger.is_recording() {
        let rest = s.trigger.stop_all(now_ms());
        post(client, rest).await;
        match client.stop_recording(&s.version).await {
            Ok(stopped) => info!(
                "recording {} is {}: {} ms, {} markers",
                stopped.version, stopped.status, stopped.duration_ms, stopped.marker_count
            ),
            Err(e) => warn!("stop recording: {:#}", e),
        }
    }
    Ok(Some(s.version))
}

/// Start due cues, collect finished ones, log budget warnings
fn run_cues(s: &mut Session, cues: &[CueSpec], now: i64) -> Vec<Cue> {
    let mut out = Vec::new();
    while let Some(cue) = cues.get(s.next_cue) {
        if now - s.started_at_ms < cue.at_ms as i64 {
            break;
        }
        info!("cue {} {} at {} ms", cue.artist_id, cue.track_type, cue.at_ms);
        out.extend(s.trigger.play(
            now,
            &cue.artist_id,
            cue.track_type,
            &cue.track_key,
            cue.duration_ms,
        ));
        s.next_cue += 1;
    }
    out.extend(s.trigger.tick(now));
    if let Some(threshold) = s.countdown.check(now) {
        warn!("{} s of recording budget left", threshold / 1000);
    }
    out
}

async fn post(client: &Client, cues: Vec<Cue>) {
    for cue in cues {
        match client.add_marker(&cue.version, &cue.marker).await {
            Ok(added) => info!(
                "marker {} at {} ms ({} total)",
                added.index, added.offset_ms, added.marker_count
            ),
            Err(e) => warn!("marker for {} dropped: {:#}", cue.marker.track_key, e),
        }
    }
}

async fn finalize(client: &Client, show_id: &str, version: &str) -> Result<()> {
    let mut sub = progress::follow(client.clone(), show_id, version, Backoff::default());
    while let Some(p) = sub.updates.recv().await {
        info!(
            "[{}] {} {}%{}: {}",
            version,
            p.phase,
            p.percent,
            if p.resumed { " (resumed)" } else { "" },
            p.detail
        );
        if p.is_terminal() {
            break;
        }
    }
    match sub.finished().await {
        ProgressState::Complete => {
            let info = client.version(show_id, version).await?;
            info!(
                "finalized {}/{}: {}",
                show_id,
                version,
                info.download_url.unwrap_or_default()
            );
            Ok(())
        }
        ProgressState::Failed { message } => bail!("finalize failed: {}", message),
        other => bail!("finalize not followed to the end: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cue() {
        let cue = parse_cue("A, track1, artists/A/t1.wav, 12000, 8000").unwrap();
        assert_eq!(cue.artist_id, "A");
        assert_eq!(cue.track_type, TrackType::Track1);
        assert_eq!(cue.at_ms, 12_000);
        assert_eq!(cue.duration_ms, 8_000);
        assert!(parse_cue("A,track9,k,1,1").is_err());
        assert!(parse_cue("A,track1").is_err());
    }
}
