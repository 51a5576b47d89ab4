use crate::request::{FinalizeQuery, StreamQuery};

pub const STREAM_WS: &str = "/api/stream/ws";
pub const STREAM_STATUS: &str = "/api/stream/status";
pub const STREAM_STOP: &str = "/api/stream/stop";

pub const RECORDING_START: &str = "/api/recording/start";
pub const RECORDING_STOP: &str = "/api/recording/stop";
pub const RECORDING_MARKER: &str = "/api/recording/marker";
pub const RECORDING_STATUS: &str = "/api/recording/status";

pub const TRANSFER_INIT: &str = "/api/transfer/init";
pub const TRANSFER_SINGLE: &str = "/api/transfer/single";

pub fn stream_ws(qry: StreamQuery) -> String {
    let query = serde_html_form::to_string(qry).unwrap_or_default();
    format!("{}?{}", STREAM_WS, query)
}

pub fn show_recordings(show: &str) -> String {
    format!("/api/shows/{}/recordings", show)
}

pub fn recording(show: &str, version: &str) -> String {
    format!("/api/recordings/{}/{}", show, version)
}

pub fn recording_download(show: &str, version: &str) -> String {
    format!("/api/recordings/{}/{}/download", show, version)
}

pub fn finalize(show: &str, version: &str) -> String {
    format!("/api/recordings/{}/{}/finalize", show, version)
}

pub fn finalize_ws(show: &str, version: &str) -> String {
    format!("/api/recordings/{}/{}/finalize/ws", show, version)
}

pub fn finalize_ws_query(show: &str, version: &str, qry: FinalizeQuery) -> String {
    let query = serde_html_form::to_string(qry).unwrap_or_default();
    format!("{}?{}", finalize_ws(show, version), query)
}

pub fn transfer_chunk(session: &str, index: &str) -> String {
    format!("/api/transfer/{}/chunk/{}", session, index)
}

pub fn transfer_finalize(session: &str) -> String {
    format!("/api/transfer/{}/finalize", session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_paths() {
        assert_eq!(
            stream_ws(StreamQuery { force: true }),
            "/api/stream/ws?force=true"
        );
        assert_eq!(
            finalize_ws_query("s1", "v1", FinalizeQuery { watch: false }),
            "/api/recordings/s1/v1/finalize/ws?watch=false"
        );
        assert_eq!(transfer_chunk("abc", "3"), "/api/transfer/abc/chunk/3");
    }
}
