use std::time::Duration;

use api::recording::{Marker, TrackType, VersionStatus};
use api::request::{TransferInit, TransferMetadata};
use api::response::ErrorBody;
use caster::client::api_error;
use caster::upload::Uploader;
use caster::Backoff;
use storage::{BlobStore, StorageConfig};

mod common;

#[tokio::test]
async fn test_chunked_file_upload_lands_in_storage() {
    let station = common::start().await;
    let client = station.client("producer");

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let uploader = Uploader::new(
        client.clone(),
        0,
        32 * 1024,
        Backoff::new(Duration::from_millis(10), Duration::from_millis(50), 3),
    );
    let done = uploader
        .upload(
            TransferMetadata::File {
                name: "promo.bin".to_string(),
            },
            &data,
        )
        .await
        .unwrap();
    assert_eq!(done.size, data.len() as u64);
    assert!(done.final_key.starts_with("uploads/"));
    assert!(done.final_key.ends_with("/promo.bin"));

    let store = BlobStore::from_config(&StorageConfig::fs(
        station.dir.path().join("store").display(),
    ))
    .await
    .unwrap();
    assert_eq!(store.get(&done.final_key).await.unwrap(), data);

    station.shutdown().await;
}

#[tokio::test]
async fn test_out_of_order_chunk_is_rejected_with_expected_index() {
    let station = common::start().await;
    let client = station.client("producer");

    let session = client
        .transfer_init(&TransferInit {
            total_size: 8,
            total_chunks: 2,
            metadata: TransferMetadata::File {
                name: "x.bin".to_string(),
            },
        })
        .await
        .unwrap();

    let err = client
        .transfer_chunk(&session.session_id, 1, vec![1; 4])
        .await
        .unwrap_err();
    let api = api_error(&err).unwrap();
    assert_eq!(api.status, 409);
    assert!(api.is("chunk_gap"));
    assert_eq!(api.body.expected, Some(0));

    client
        .transfer_chunk(&session.session_id, 0, vec![0; 4])
        .await
        .unwrap();
    let err = client
        .transfer_finalize(&session.session_id)
        .await
        .unwrap_err();
    assert_eq!(api_error(&err).unwrap().body.expected, Some(1));

    // another operator cannot touch the session
    let other = station.client("intruder");
    let err = other
        .transfer_chunk(&session.session_id, 1, vec![1; 4])
        .await
        .unwrap_err();
    assert_eq!(api_error(&err).unwrap().status, 403);

    client
        .transfer_chunk(&session.session_id, 1, vec![1; 4])
        .await
        .unwrap();
    let done = client.transfer_finalize(&session.session_id).await.unwrap();
    assert_eq!(done.size, 8);

    station.shutdown().await;
}

#[tokio::test]
async fn test_offline_recording_upload_becomes_raw_version() {
    let station = common::start().await;
    let client = station.client("producer");

    let markers = vec![
        Marker {
            artist_id: "A".to_string(),
            track_type: TrackType::Track2,
            track_key: "artists/A/t2.wav".to_string(),
            duration_ms: 500,
            offset_ms: 1_000,
        },
        Marker {
            artist_id: "B".to_string(),
            track_type: TrackType::Track1,
            track_key: "artists/B/t1.wav".to_string(),
            duration_ms: 500,
            offset_ms: 200,
        },
    ];
    let uploader = Uploader::new(client.clone(), 1024, 4096, Backoff::default());
    let done = uploader
        .upload(
            TransferMetadata::Recording {
                show_id: "S".to_string(),
                markers,
                duration_ms: None,
            },
            &common::wav(1_500, 0),
        )
        .await
        .unwrap();
    let version = done.version.unwrap();
    assert_eq!(done.show_id.as_deref(), Some("S"));

    let info = client.version("S", &version).await.unwrap();
    assert_eq!(info.status, VersionStatus::Raw);
    assert_eq!(info.marker_count, 2);
    assert_eq!(info.duration_ms, 1_500);

    // a body that is not audio never becomes a version
    let err = client
        .transfer_single(
            &TransferMetadata::Recording {
                show_id: "S".to_string(),
                markers: vec![],
                duration_ms: None,
            },
            b"definitely not a wav file".to_vec(),
        )
        .await
        .unwrap_err();
    let body: &ErrorBody = &api_error(&err).unwrap().body;
    assert_eq!(body.error, "decode_failure");
    assert_eq!(client.versions("S").await.unwrap().len(), 1);

    station.shutdown().await;
}
