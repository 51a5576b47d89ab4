use std::fmt;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use api::event::FinalizeProgress;
use api::recording::{RecordingState, RecordingVersionInfo};
use api::request::{
    AddMarker, FinalizeQuery, StartRecording, StreamQuery, TransferInit, TransferMetadata,
    VersionQuery, OPERATOR_HEADER, SINGLE_FILE_FIELD, SINGLE_METADATA_FIELD, TOKEN_QUERY,
};
use api::response::{
    ChunkAccepted, ErrorBody, MarkerAdded, RecordingStarted, RecordingStopped, StreamStatus,
    TransferComplete, TransferSession,
};

/// A non-2xx answer carrying the server's error body
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: u16,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn kind(&self) -> &str {
        &self.body.error
    }

    pub fn is(&self, kind: &str) -> bool {
        self.body.error == kind
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.body.error, self.status, self.body.message)
    }
}

impl std::error::Error for ApiError {}

/// The `ApiError` behind an `anyhow::Error`, if that is what it is
pub fn api_error(err: &anyhow::Error) -> Option<&ApiError> {
    err.downcast_ref::<ApiError>()
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
    /// Used by servers running without authentication
    pub operator: Option<String>,
}

#[derive(Clone)]
pub struct Client {
    url: String,
    credentials: Credentials,
    default_headers: HeaderMap,
    http: reqwest::Client,
}

impl Client {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(token) = &credentials.token {
            default_headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        if let Some(operator) = &credentials.operator {
            default_headers.insert(OPERATOR_HEADER, HeaderValue::from_str(operator)?);
        }
        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            credentials,
            default_headers,
            http: reqwest::Client::builder().build()?,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    /// WebSocket request for `path`, token in the query and operator header
    pub fn ws_request(&self, path: &str) -> Result<Request> {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        };
        let mut url = format!("{}{}", base, path);
        if let Some(token) = &self.credentials.token {
            let sep = if path.contains('?') { '&' } else { '?' };
            url = format!("{}{}{}={}", url, sep, TOKEN_QUERY, token);
        }
        let mut request = url.into_client_request()?;
        if let Some(operator) = &self.credentials.operator {
            request
                .headers_mut()
                .insert(OPERATOR_HEADER, HeaderValue::from_str(operator)?);
        }
        Ok(request)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .headers(self.default_headers.clone())
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = check(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.call(self.request(Method::POST, path).json(body)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(self.request(Method::GET, path)).await
    }

    pub async fn stream_status(&self) -> Result<StreamStatus> {
        self.get_json(api::path::STREAM_STATUS).await
    }

    pub async fn stop_stream(&self) -> Result<StreamStatus> {
        self.call(self.request(Method::POST, api::path::STREAM_STOP))
            .await
    }

    pub fn stream_ws(&self, force: bool) -> Result<Request> {
        self.ws_request(&api::path::stream_ws(StreamQuery { force }))
    }

    pub async fn start_recording(&self, show_id: &str) -> Result<RecordingStarted> {
        self.post_json(
            api::path::RECORDING_START,
            &StartRecording {
                show_id: show_id.to_string(),
            },
        )
        .await
    }

    pub async fn stop_recording(&self, version: &str) -> Result<RecordingStopped> {
        let query = VersionQuery {
            version: version.to_string(),
        };
        self.call(
            self.request(Method::POST, api::path::RECORDING_STOP)
                .query(&query),
        )
        .await
    }

    pub async fn add_marker(&self, version: &str, marker: &AddMarker) -> Result<MarkerAdded> {
        let query = VersionQuery {
            version: version.to_string(),
        };
        self.call(
            self.request(Method::POST, api::path::RECORDING_MARKER)
                .query(&query)
                .json(marker),
        )
        .await
    }

    pub async fn recording_status(&self) -> Result<RecordingState> {
        self.get_json(api::path::RECORDING_STATUS).await
    }

    pub async fn versions(&self, show_id: &str) -> Result<Vec<RecordingVersionInfo>> {
        self.get_json(&api::path::show_recordings(show_id)).await
    }

    pub async fn version(&self, show_id: &str, version: &str) -> Result<RecordingVersionInfo> {
        self.get_json(&api::path::recording(show_id, version)).await
    }

    pub async fn finalize(&self, show_id: &str, version: &str) -> Result<FinalizeProgress> {
        self.call(self.request(Method::POST, &api::path::finalize(show_id, version)))
            .await
    }

    pub fn finalize_ws(&self, show_id: &str, version: &str, watch: bool) -> Result<Request> {
        self.ws_request(&api::path::finalize_ws_query(
            show_id,
            version,
            FinalizeQuery { watch },
        ))
    }

    pub async fn transfer_init(&self, init: &TransferInit) -> Result<TransferSession> {
        self.post_json(api::path::TRANSFER_INIT, init).await
    }

    pub async fn transfer_chunk(
        &self,
        session_id: &str,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<ChunkAccepted> {
        self.call(
            self.request(
                Method::PUT,
                &api::path::transfer_chunk(session_id, &index.to_string()),
            )
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes),
        )
        .await
    }

    pub async fn transfer_finalize(&self, session_id: &str) -> Result<TransferComplete> {
        self.call(self.request(Method::POST, &api::path::transfer_finalize(session_id)))
            .await
    }

    pub async fn transfer_single(
        &self,
        metadata: &TransferMetadata,
        bytes: Vec<u8>,
    ) -> Result<TransferComplete> {
        let form = reqwest::multipart::Form::new()
            .text(SINGLE_METADATA_FIELD, serde_json::to_string(metadata)?)
            .part(
                SINGLE_FILE_FIELD,
                reqwest::multipart::Part::bytes(bytes).file_name("upload.bin"),
            );
        self.call(self.request(Method::POST, api::path::TRANSFER_SINGLE).multipart(form))
            .await
    }

    /// Whole finalized recording
    pub async fn download(&self, show_id: &str, version: &str) -> Result<Vec<u8>> {
        let response = check(
            self.request(Method::GET, &api::path::recording_download(show_id, version))
                .send()
                .await?,
        )
        .await?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response
        .text()
        .await
        .with_context(|| format!("read {} body", status))?;
    let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| ErrorBody {
        error: status
            .canonical_reason()
            .unwrap_or("unknown")
            .to_lowercase()
            .replace(' ', "_"),
        message: text,
        ..Default::default()
    });
    Err(anyhow!(ApiError {
        status: status.as_u16(),
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_request_carries_token_and_operator() {
        let client = Client::new(
            "https://radio.example/",
            Credentials {
                token: Some("t0k".to_string()),
                operator: Some("alice".to_string()),
            },
        )
        .unwrap();
        let req = client.stream_ws(true).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "wss://radio.example/api/stream/ws?force=true&access_token=t0k"
        );
        assert_eq!(req.headers().get(OPERATOR_HEADER).unwrap(), "alice");

        let open = Client::new("http://localhost:7700", Credentials::default()).unwrap();
        let req = open.finalize_ws("s1", "v1", true).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "ws://localhost:7700/api/recordings/s1/v1/finalize/ws?watch=true"
        );
    }

    #[test]
    fn test_api_error_downcasts_through_anyhow() {
        let err = anyhow!(ApiError {
            status: 409,
            body: ErrorBody {
                error: "chunk_gap".to_string(),
                message: "expected chunk 2, got 3".to_string(),
                expected: Some(2),
                ..Default::default()
            },
        });
        let api = api_error(&err).unwrap();
        assert!(api.is("chunk_gap"));
        assert_eq!(api.body.expected, Some(2));
        assert!(api_error(&anyhow!("plain")).is_none());
    }
}
