use std::io::Cursor;
use std::time::Duration;

use api::recording::{Marker, TrackType};
use api::wav::streaming_header;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use storage::StorageConfig;
use tempfile::TempDir;

use super::*;
use crate::audio::StreamFormat;
use crate::recording::VersionRecord;

const RATE: u32 = 8_000;

struct Fixture {
    _dir: TempDir,
    _work: TempDir,
    store: BlobStore,
    versions: Arc<VersionStore>,
    finalizer: Finalizer,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let store = BlobStore::from_config(&StorageConfig::fs(dir.path().to_string_lossy()))
        .await
        .unwrap();
    let versions = Arc::new(VersionStore::new(store.clone(), Duration::from_secs(60)));
    let config = FinalizeConfig {
        work_dir: work.path().to_string_lossy().into_owned(),
        retry_attempts: 2,
        retry_base_ms: 1,
        download_chunk_bytes: 4096,
        upload_chunk_bytes: 4096,
        ..Default::default()
    };
    let finalizer = Finalizer::new(store.clone(), versions.clone(), config);
    Fixture {
        _dir: dir,
        _work: work,
        store,
        versions,
        finalizer,
    }
}

fn tone(frames: usize, value: i16) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn silence(frames: usize) -> Vec<u8> {
    let mut raw = streaming_header(&StreamFormat::pcm16(RATE, 1));
    raw.resize(raw.len() + frames * 2, 0);
    raw
}

fn marker(track_key: &str, offset_ms: u64, duration_ms: u64) -> Marker {
    Marker {
        artist_id: "A".to_string(),
        track_type: TrackType::Track1,
        track_key: track_key.to_string(),
        duration_ms,
        offset_ms,
    }
}

async fn seed(f: &Fixture, raw_frames: usize, markers: &[Marker]) -> String {
    let (version, at) = f.versions.mint();
    let mut record = VersionRecord::new("show", &version, VersionStatus::Raw, at.timestamp_millis());
    record.marker_count = markers.len();
    record.duration_ms = raw_frames as u64 * 1000 / RATE as u64;
    f.store.put(&record.raw_key, silence(raw_frames)).await.unwrap();
    f.versions.create(&record).await.unwrap();
    f.versions
        .save_markers("show", &version, markers)
        .await
        .unwrap();
    version
}

async fn drain(mut sub: Subscription) -> Vec<FinalizeProgress> {
    let mut seen = vec![sub.snapshot.clone()];
    if sub.snapshot.is_terminal() {
        return seen;
    }
    let Some(mut rx) = sub.rx.take() else {
        return seen;
    };
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(p) => {
                    let done = p.is_terminal();
                    seen.push(p);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let latest = sub.latest();
                    let done = latest.is_terminal();
                    seen.push(latest);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .unwrap();
    seen
}

// the job leaves the map right after publishing its terminal state
async fn settle(f: &Fixture) {
    for _ in 0..500 {
        if f.finalizer.running_jobs() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("finalize job never left the map");
}

async fn final_samples(f: &Fixture, version: &str) -> Vec<i16> {
    let bytes = f
        .store
        .get(&path::final_key("show", version))
        .await
        .unwrap();
    WavReader::new(Cursor::new(bytes))
        .unwrap()
        .samples::<i16>()
        .map(|s| s.unwrap())
        .collect()
}

#[tokio::test]
async fn test_finalize_mixes_markers_in_offset_order() {
    let f = fixture().await;
    f.store.put("artists/a/up.wav", tone(16_000, 6_000)).await.unwrap();
    f.store.put("artists/b/down.wav", tone(16_000, -6_000)).await.unwrap();
    // arrival order is the reverse of offset order
    let version = seed(
        &f,
        32_000,
        &[
            marker("artists/b/down.wav", 2_500, 1_000),
            marker("artists/a/up.wav", 500, 1_000),
        ],
    )
    .await;

    let events = drain(f.finalizer.finalize("show", &version).await.unwrap()).await;
    let last = events.last().unwrap();
    assert_eq!(last.phase, FinalizePhase::Complete, "{:?}", last);
    assert!(!last.resumed);
    assert!(events
        .windows(2)
        .all(|w| w[0].phase.rank() <= w[1].phase.rank()));

    let samples = final_samples(&f, &version).await;
    assert_eq!(samples.len(), 32_000);
    assert!(samples[..4_000].iter().all(|s| *s == 0));
    assert!(samples[4_000..12_000].iter().all(|s| (*s - 6_000).abs() <= 1));
    assert!(samples[12_000..20_000].iter().all(|s| *s == 0));
    assert!(samples[20_000..28_000].iter().all(|s| (*s + 6_000).abs() <= 1));
    assert!(samples[28_000..].iter().all(|s| *s == 0));

    let record = f.versions.get("show", &version).await.unwrap();
    assert_eq!(record.status, VersionStatus::Finalized);
    let info = f.versions.info(&record).await;
    assert!(info.download_url.is_some());

    settle(&f).await;
    let again = f.finalizer.finalize("show", &version).await.unwrap();
    assert_eq!(again.snapshot.phase, FinalizePhase::Complete);
    assert!(again.rx.is_none());
}

#[tokio::test]
async fn test_resume_after_download_starts_at_merging() {
    let f = fixture().await;
    f.store.put("artists/a/up.wav", tone(8_000, 6_000)).await.unwrap();
    let version = seed(&f, 16_000, &[marker("artists/a/up.wav", 0, 500)]).await;

    // a previous process downloaded everything and then went away
    let record = f
        .versions
        .transition("show", &version, VersionStatus::Finalizing, |_| {})
        .await
        .unwrap();
    let mut job = Job::prepare(f.finalizer.ctx.clone(), &record, None)
        .await
        .unwrap();
    job.download().await.unwrap();
    drop(job);

    let sub = f.finalizer.finalize("show", &version).await.unwrap();
    assert!(sub.snapshot.resumed);
    assert_eq!(sub.snapshot.phase, FinalizePhase::Merging);

    let events = drain(sub).await;
    assert!(events
        .iter()
        .all(|p| p.phase != FinalizePhase::Downloading && p.resumed));
    assert_eq!(events.last().unwrap().phase, FinalizePhase::Complete);
}

#[tokio::test]
async fn test_second_call_attaches_to_running_job() {
    let f = fixture().await;
    f.store.put("artists/a/up.wav", tone(8_000, 6_000)).await.unwrap();
    let version = seed(&f, RATE as usize * 60, &[marker("artists/a/up.wav", 1_000, 1_000)]).await;

    let (first, second) = tokio::join!(
        f.finalizer.finalize("show", &version),
        f.finalizer.finalize("show", &version)
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(first.same_job(&second));
    assert_eq!(f.finalizer.running_jobs(), 1);

    let watcher = f.finalizer.subscribe("show", &version).await.unwrap();
    assert!(watcher.same_job(&first));

    let a = drain(first).await;
    let b = drain(second).await;
    assert_eq!(a.last().unwrap().phase, FinalizePhase::Complete);
    assert_eq!(b.last().unwrap().phase, FinalizePhase::Complete);

    let checkpoint: Checkpoint = f
        .store
        .get_json(&path::checkpoint_key("show", &version))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.phase, FinalizePhase::Complete);

    settle(&f).await;
    let late = f.finalizer.subscribe("show", &version).await.unwrap();
    assert_eq!(late.snapshot.phase, FinalizePhase::Complete);
}

#[tokio::test]
async fn test_decode_failure_names_key_and_can_be_retried() {
    let f = fixture().await;
    f.store
        .put("artists/a/broken.wav", vec![7u8; 2048])
        .await
        .unwrap();
    let version = seed(&f, 16_000, &[marker("artists/a/broken.wav", 100, 500)]).await;

    let events = drain(f.finalizer.finalize("show", &version).await.unwrap()).await;
    let last = events.last().unwrap();
    assert_eq!(last.phase, FinalizePhase::Error);
    assert!(last.detail.contains("artists/a/broken.wav"), "{}", last.detail);

    let record = f.versions.get("show", &version).await.unwrap();
    assert_eq!(record.status, VersionStatus::Failed);
    assert!(record
        .error_message
        .unwrap_or_default()
        .contains("artists/a/broken.wav"));

    let watched = f.finalizer.subscribe("show", &version).await.unwrap();
    assert_eq!(watched.snapshot.phase, FinalizePhase::Error);

    settle(&f).await;
    f.store
        .put("artists/a/broken.wav", tone(8_000, 6_000))
        .await
        .unwrap();
    let retry = f.finalizer.finalize("show", &version).await.unwrap();
    assert!(retry.snapshot.resumed);
    let events = drain(retry).await;
    assert_eq!(events.last().unwrap().phase, FinalizePhase::Complete);
    assert_eq!(
        f.versions.get("show", &version).await.unwrap().status,
        VersionStatus::Finalized
    );
}

#[tokio::test]
async fn test_missing_version_and_recording_version() {
    let f = fixture().await;
    assert!(matches!(
        f.finalizer.finalize("show", "nope").await,
        Err(AppError::NotFound(_))
    ));

    let (version, at) = f.versions.mint();
    f.versions
        .create(&VersionRecord::new(
            "show",
            &version,
            VersionStatus::Recording,
            at.timestamp_millis(),
        ))
        .await
        .unwrap();
    assert!(matches!(
        f.finalizer.finalize("show", &version).await,
        Err(AppError::InvalidTransition(_))
    ));
    assert!(matches!(
        f.finalizer.subscribe("show", &version).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_resume_interrupted_picks_up_finalizing_versions() {
    let f = fixture().await;
    f.store.put("artists/a/up.wav", tone(8_000, 6_000)).await.unwrap();
    let version = seed(&f, 16_000, &[marker("artists/a/up.wav", 0, 500)]).await;
    let untouched = seed(&f, 8_000, &[]).await;

    // the process stopped before the job wrote anything
    f.versions
        .transition("show", &version, VersionStatus::Finalizing, |_| {})
        .await
        .unwrap();

    assert_eq!(f.finalizer.resume_interrupted().await.unwrap(), 1);
    let events = drain(f.finalizer.subscribe("show", &version).await.unwrap()).await;
    assert_eq!(events.last().unwrap().phase, FinalizePhase::Complete);

    settle(&f).await;
    assert_eq!(f.finalizer.resume_interrupted().await.unwrap(), 0);
    assert_eq!(
        f.versions.get("show", &untouched).await.unwrap().status,
        VersionStatus::Raw
    );
}

#[tokio::test]
async fn test_huge_marker_duration_still_completes() {
    let f = fixture().await;
    f.store.put("artists/a/up.wav", tone(8_000, 6_000)).await.unwrap();
    let version = seed(&f, 16_000, &[marker("artists/a/up.wav", 0, u64::MAX / 2)]).await;

    let events = drain(f.finalizer.finalize("show", &version).await.unwrap()).await;
    assert_eq!(events.last().unwrap().phase, FinalizePhase::Complete);
    settle(&f).await;

    let samples = final_samples(&f, &version).await;
    assert_eq!(samples.len(), 16_000);
    assert!(samples[..8_000].iter().all(|s| (*s - 6_000).abs() <= 1));
    assert!(samples[8_000..].iter().all(|s| *s == 0));
}

#[tokio::test]
async fn test_crashed_job_fails_version_and_frees_the_slot() {
    let f = fixture().await;
    let version = seed(&f, 8_000, &[]).await;
    let record = f
        .versions
        .transition("show", &version, VersionStatus::Finalizing, |_| {})
        .await
        .unwrap();
    let job = Job::prepare(f.finalizer.ctx.clone(), &record, None)
        .await
        .unwrap();
    let state = job.state();
    let key = ("show".to_string(), version.clone());
    f.finalizer
        .jobs
        .lock()
        .unwrap()
        .insert(key.clone(), state.clone());

    let crashing = tokio::spawn(async move {
        let latest = job.state().latest();
        if latest.phase != FinalizePhase::Complete {
            panic!("mixer blew up");
        }
        latest
    });
    let last = supervise(
        f.finalizer.ctx.clone(),
        f.finalizer.jobs.clone(),
        key,
        state,
        crashing,
    )
    .await;
    assert_eq!(last.phase, FinalizePhase::Error);
    assert_eq!(f.finalizer.running_jobs(), 0);

    let record = f.versions.get("show", &version).await.unwrap();
    assert_eq!(record.status, VersionStatus::Failed);
    assert!(record.error_message.unwrap_or_default().contains("crashed"));
    let watched = f.finalizer.subscribe("show", &version).await.unwrap();
    assert_eq!(watched.snapshot.phase, FinalizePhase::Error);
    assert!(watched.rx.is_none());

    // nothing is left attached to the dead job
    let retry = f.finalizer.finalize("show", &version).await.unwrap();
    let events = drain(retry).await;
    assert_eq!(events.last().unwrap().phase, FinalizePhase::Complete);
}
