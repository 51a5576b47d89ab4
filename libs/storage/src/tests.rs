use tempfile::TempDir;

use crate::{create_operator, path, BlobStore, StorageConfig};

fn fs_store(dir: &TempDir) -> BlobStore {
    let config = StorageConfig::fs(dir.path().to_string_lossy());
    BlobStore::new(create_operator(&config).expect("fs operator"))
}

#[tokio::test]
async fn test_s3_storage_config() {
    let config = StorageConfig::S3 {
        bucket: "test-bucket".to_string(),
        root: "/test".to_string(),
        region: Some("us-east-1".to_string()),
        endpoint: Some("http://localhost:9000".to_string()),
        access_key_id: Some("minioadmin".to_string()),
        secret_access_key: Some("minioadmin".to_string()),
        session_token: None,
        disable_config_load: true,
        enable_virtual_host_style: false,
    };

    let result = create_operator(&config);
    assert!(result.is_ok(), "Failed to create S3 storage operator");
}

#[test]
fn test_default_storage_config() {
    match StorageConfig::default() {
        StorageConfig::Fs {
            root,
            atomic_write_dir,
        } => {
            assert_eq!(root, "./storage");
            assert!(atomic_write_dir.is_none());
        }
        _ => panic!("Default storage should be FS"),
    }
}

#[test]
fn test_fs_config_parsing() {
    let toml_str = r#"
type = "fs"
root = "/var/lib/onair"
atomic_write_dir = "/var/lib/onair/.tmp"
"#;

    let config: StorageConfig = toml::from_str(toml_str).expect("Failed to parse FS TOML config");
    match config {
        StorageConfig::Fs {
            root,
            atomic_write_dir,
        } => {
            assert_eq!(root, "/var/lib/onair");
            assert_eq!(atomic_write_dir.as_deref(), Some("/var/lib/onair/.tmp"));
        }
        _ => panic!("Expected FS storage config"),
    }
}

#[test]
fn test_oss_config_parsing() {
    let toml_str = r#"
type = "oss"
bucket = "station-archive"
region = "oss-cn-beijing"
endpoint = "https://oss-cn-beijing.aliyuncs.com"
"#;

    let config: StorageConfig = toml::from_str(toml_str).expect("Failed to parse OSS TOML config");
    match config {
        StorageConfig::Oss { bucket, root, .. } => {
            assert_eq!(bucket, "station-archive");
            assert_eq!(root, "/");
        }
        _ => panic!("Expected OSS storage config"),
    }
}

#[tokio::test]
async fn test_put_get_and_range() {
    let dir = TempDir::new().unwrap();
    let store = fs_store(&dir);

    store.put("a/b.bin", b"0123456789".to_vec()).await.unwrap();
    assert_eq!(store.get("a/b.bin").await.unwrap(), b"0123456789");
    assert_eq!(store.range_get("a/b.bin", 2, 3).await.unwrap(), b"234");
    assert_eq!(store.stat("a/b.bin").await.unwrap(), Some(10));
    assert_eq!(store.stat("a/missing").await.unwrap(), None);

    store.delete("a/b.bin").await.unwrap();
    assert!(!store.exists("a/b.bin").await.unwrap());
}

#[tokio::test]
async fn test_appender_grows_object() {
    let dir = TempDir::new().unwrap();
    let store = fs_store(&dir);
    let key = path::raw_key("s", "v");

    store.put(&key, b"stale content".to_vec()).await.unwrap();

    let mut appender = store.appender(&key, b"HEAD".to_vec()).await.unwrap();
    appender.append(b"-one".to_vec()).await.unwrap();
    appender.append(b"-two".to_vec()).await.unwrap();
    assert_eq!(appender.written(), 12);
    assert_eq!(appender.close().await.unwrap(), 12);

    assert_eq!(store.get(&key).await.unwrap(), b"HEAD-one-two");
}

#[tokio::test]
async fn test_json_and_list_dirs() {
    let dir = TempDir::new().unwrap();
    let store = fs_store(&dir);

    assert!(store
        .get_json::<serde_json::Value>(&path::info_key("s", "v1"))
        .await
        .unwrap()
        .is_none());

    for v in ["v2", "v1"] {
        store
            .put_json(&path::info_key("s", v), &serde_json::json!({ "version": v }))
            .await
            .unwrap();
    }
    let value: serde_json::Value = store
        .get_json(&path::info_key("s", "v2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value["version"], "v2");

    let dirs = store.list_dirs(&path::show_prefix("s")).await.unwrap();
    assert_eq!(dirs, vec!["v1".to_string(), "v2".to_string()]);
    assert!(store
        .list_dirs(&path::show_prefix("nobody"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_fs_has_no_presign() {
    let dir = TempDir::new().unwrap();
    let store = fs_store(&dir);
    assert!(!store.supports_presign());
    assert!(store
        .presign_read("x", std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .is_none());
}
