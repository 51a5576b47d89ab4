//! Storage key layout.
//!
//! ```text
//! recordings/{show}/{version}/raw              live capture (streaming WAV)
//! recordings/{show}/{version}/markers.json     marker timeline
//! recordings/{show}/{version}/info.json        version record
//! recordings/{show}/{version}/checkpoint.json  finalize checkpoint
//! recordings/{show}/{version}/final.wav        finished mix
//! pending/{session}/chunk-{index:06}           staged transfer chunks
//! uploads/{session}/{name}                     assembled opaque uploads
//! ```

use std::path::Path;

pub const RECORDINGS: &str = "recordings";
pub const PENDING: &str = "pending";
pub const UPLOADS: &str = "uploads";

pub fn show_prefix(show: &str) -> String {
    format!("{}/{}/", RECORDINGS, show)
}

pub fn version_prefix(show: &str, version: &str) -> String {
    format!("{}/{}/{}/", RECORDINGS, show, version)
}

pub fn raw_key(show: &str, version: &str) -> String {
    format!("{}raw", version_prefix(show, version))
}

pub fn markers_key(show: &str, version: &str) -> String {
    format!("{}markers.json", version_prefix(show, version))
}

pub fn info_key(show: &str, version: &str) -> String {
    format!("{}info.json", version_prefix(show, version))
}

pub fn checkpoint_key(show: &str, version: &str) -> String {
    format!("{}checkpoint.json", version_prefix(show, version))
}

pub fn final_key(show: &str, version: &str) -> String {
    format!("{}final.wav", version_prefix(show, version))
}

pub fn pending_chunk_key(session: &str, index: u32) -> String {
    format!("{}/{}/chunk-{:06}", PENDING, session, index)
}

pub fn upload_key(session: &str, name: &str) -> String {
    format!("{}/{}/{}", UPLOADS, session, name)
}

/// Extract directory path from full storage path
pub fn get_directory(path: &str) -> Option<&str> {
    Path::new(path).parent()?.to_str()
}

/// Validate storage path format
pub fn validate_path(path: &str) -> bool {
    !path.is_empty() && !path.contains("..") && !path.starts_with('/')
}

/// A single key segment such as a show id or version
pub fn validate_segment(segment: &str) -> bool {
    validate_path(segment) && !segment.contains('/') && !segment.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_keys() {
        assert_eq!(
            raw_key("show-1", "2024-01-15T12-00-00-000"),
            "recordings/show-1/2024-01-15T12-00-00-000/raw"
        );
        assert_eq!(
            checkpoint_key("s", "v"),
            "recordings/s/v/checkpoint.json"
        );
        assert_eq!(final_key("s", "v"), "recordings/s/v/final.wav");
        assert_eq!(pending_chunk_key("abc", 7), "pending/abc/chunk-000007");
    }

    #[test]
    fn test_get_directory() {
        assert_eq!(get_directory("recordings/s/v/raw"), Some("recordings/s/v"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("recordings/s/v/raw"));
        assert!(!validate_path("../recordings/raw"));
        assert!(!validate_path("/absolute/path"));
        assert!(!validate_path(""));
        assert!(validate_segment("show-42"));
        assert!(!validate_segment("a/b"));
    }
}
