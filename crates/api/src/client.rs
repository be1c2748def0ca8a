//! CloudDisk HTTP client.
//!
//! Async client using `reqwest` with Bearer token authentication.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::endpoint::{ByteStream, Download, EndpointFuture, ProgressFn, TransferEndpoint, UploadRequest};
use crate::error::{EndpointError, preview};
use crate::types::{ApiResponse, FileDescriptor, FolderDescriptor, mime_for_name, parse_list};
use crate::{DEFAULT_PROBE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/api";

/// Connection settings for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// API root, e.g. `http://host:5000/api`.
    pub base_url: String,
    /// Bearer credential. Requests are sent unauthenticated when `None`.
    pub token: Option<String>,
    /// Connect timeout, wait for response headers, per-chunk read and write
    /// stall limit, and total listing timeout.
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// [`TransferEndpoint`] over HTTP.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpClient {
    /// Creates a client from the given settings.
    pub fn new(settings: ClientSettings) -> Result<Self, EndpointError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = settings.token.as_deref() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| EndpointError::protocol("bearer token is not a valid header value", ""))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            request_timeout: settings.request_timeout,
            probe_timeout: settings.probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns whether `GET /health` answers with a success status.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).timeout(self.probe_timeout).send().await {
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "health probe answered");
                resp.status().is_success()
            }
            Err(e) => {
                debug!(error = %e, "health probe failed");
                false
            }
        }
    }

    /// Performs an authenticated GET and returns the envelope payload.
    async fn get_data(&self, path: &str, query: &[(&str, String)]) -> Result<Option<serde_json::Value>, EndpointError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body = resp.text().await?;
        ApiResponse::parse(&body)?.into_data(&body, path)
    }

    async fn upload_file(&self, request: UploadRequest, on_progress: ProgressFn) -> Result<FileDescriptor, EndpointError> {
        let UploadRequest {
            name,
            size_hint,
            folder_id,
            content,
        } = request;

        let sent = Arc::new(AtomicU64::new(0));
        let activity = Arc::new(Notify::new());
        let (body_sent_tx, body_sent) = oneshot::channel::<()>();
        let pulled = Arc::clone(&activity);
        let counted = content
            .map(move |chunk| {
                pulled.notify_one();
                if let Ok(bytes) = &chunk {
                    let n = sent.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
                    on_progress(n, size_hint);
                }
                chunk
            })
            .chain(
                futures_util::stream::once(async move {
                    let _ = body_sent_tx.send(());
                })
                .filter_map(|()| async { None::<Result<Bytes, EndpointError>> }),
            );

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(counted), size_hint)
            .file_name(name.clone())
            .mime_str(mime_for_name(&name))?;
        let mut form = Form::new()
            .part("file", part)
            .text("original_filename", name.clone());
        if let Some(folder_id) = folder_id {
            form = form.text("folder_id", folder_id.to_string());
        }

        debug!(name = %name, size = size_hint, ?folder_id, "uploading file");
        let url = format!("{}/upload", self.base_url);
        let send = self.http.post(&url).multipart(form).send();
        tokio::pin!(send);

        // While the body is going out, each chunk must be taken within the
        // limit; afterwards the response headers must arrive within it.
        let early = tokio::select! {
            resp = &mut send => Some(resp),
            _ = body_sent => None,
            _ = stalled(&activity, self.request_timeout) => {
                return Err(EndpointError::Network(format!(
                    "upload stalled: no data sent for {}s",
                    self.request_timeout.as_secs()
                )));
            }
        };
        let resp = match early {
            Some(resp) => resp?,
            None => response_within(send, self.request_timeout).await?,
        };
        let resp = check_status(resp).await?;
        let body = resp.text().await?;

        let data = ApiResponse::parse(&body)?.into_data(&body, "upload")?;
        let Some(data) = data else {
            return Err(EndpointError::protocol("upload response carries no file", &body));
        };
        serde_json::from_value(data).map_err(|e| EndpointError::protocol(e.to_string(), &body))
    }

    async fn open_download(&self, file_id: i64) -> Result<Download, EndpointError> {
        let url = format!("{}/files/{file_id}/download", self.base_url);
        let resp = response_within(self.http.get(&url).send(), self.request_timeout).await?;
        let resp = check_status(resp).await?;
        let total_bytes = resp.content_length().filter(|&n| n > 0);
        debug!(file_id, ?total_bytes, "download opened");
        Ok(Download {
            total_bytes,
            body: with_read_timeout(resp.bytes_stream(), self.request_timeout),
        })
    }
}

impl TransferEndpoint for HttpClient {
    fn upload(&self, request: UploadRequest, on_progress: ProgressFn) -> EndpointFuture<'_, FileDescriptor> {
        Box::pin(self.upload_file(request, on_progress))
    }

    fn download(&self, file_id: i64) -> EndpointFuture<'_, Download> {
        Box::pin(self.open_download(file_id))
    }

    fn list_folders(&self, parent_id: Option<i64>) -> EndpointFuture<'_, Vec<FolderDescriptor>> {
        Box::pin(async move {
            let query: Vec<(&str, String)> = parent_id
                .map(|id| vec![("parent_folder_id", id.to_string())])
                .unwrap_or_default();
            let data = self.get_data("/folders", &query).await?;
            Ok(parse_list(data, "folders"))
        })
    }

    fn list_files(&self, folder_id: Option<i64>) -> EndpointFuture<'_, Vec<FileDescriptor>> {
        Box::pin(async move {
            let query: Vec<(&str, String)> = folder_id
                .map(|id| vec![("folder_id", id.to_string())])
                .unwrap_or_default();
            let data = self.get_data("/files", &query).await?;
            Ok(parse_list(data, "files"))
        })
    }
}

/// Maps a non-success response to [`EndpointError::Server`].
///
/// The envelope's `error` text is preferred over the raw body.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, EndpointError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %preview(&body, 500), "request failed");
    let message = serde_json::from_str::<ApiResponse>(&body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_else(|| preview(body.trim(), 200));
    Err(EndpointError::Server {
        code: status.as_u16(),
        message,
    })
}

/// Awaits response headers for at most `limit`.
async fn response_within<F>(send: F, limit: Duration) -> Result<reqwest::Response, EndpointError>
where
    F: Future<Output = reqwest::Result<reqwest::Response>>,
{
    match tokio::time::timeout(limit, send).await {
        Ok(resp) => Ok(resp?),
        Err(_) => Err(EndpointError::Network(format!(
            "no response within {}s",
            limit.as_secs()
        ))),
    }
}

/// Completes once `activity` has gone `limit` without a notification.
async fn stalled(activity: &Notify, limit: Duration) {
    while tokio::time::timeout(limit, activity.notified()).await.is_ok() {}
}

/// Fails the stream when no chunk arrives within `timeout`.
fn with_read_timeout<S>(stream: S, timeout: Duration) -> ByteStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let stream = Box::pin(stream);
    Box::pin(futures_util::stream::unfold(
        (stream, false),
        move |(mut stream, failed)| async move {
            if failed {
                return None;
            }
            match tokio::time::timeout(timeout, stream.next()).await {
                Ok(Some(Ok(bytes))) => Some((Ok(bytes), (stream, false))),
                Ok(Some(Err(e))) => Some((Err(EndpointError::from(e)), (stream, true))),
                Ok(None) => None,
                Err(_) => Some((
                    Err(EndpointError::Network(format!(
                        "no data received for {}s",
                        timeout.as_secs()
                    ))),
                    (stream, true),
                )),
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Reads one HTTP request until the headers (and any multipart body)
    /// have arrived or the peer goes quiet.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            }
            let text = String::from_utf8_lossy(&buf);
            if let Some(idx) = text.find("\r\n\r\n") {
                if text.starts_with("GET") {
                    break;
                }
                let body = &text[idx + 4..];
                if body.ends_with("--\r\n") || body.ends_with("0\r\n\r\n") {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Starts a mock HTTP server that answers one request with `status` and
    /// `body`; the join handle yields the raw request text.
    async fn mock_server(status: u16, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/api");
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return String::new();
            };
            let request = read_request(&mut stream).await;
            let resp = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
            request
        });

        (url, handle)
    }

    /// Accepts one connection, reads the request and never answers.
    async fn silent_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let _ = read_request(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });
        (format!("http://127.0.0.1:{port}/api"), handle)
    }

    fn impatient_client(url: String) -> HttpClient {
        HttpClient::new(ClientSettings {
            base_url: url,
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap()
    }

    fn client(url: String) -> HttpClient {
        HttpClient::new(ClientSettings {
            base_url: url,
            token: Some("secret-token".into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn single_chunk(data: &'static [u8]) -> ByteStream {
        Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn list_files_sends_bearer_and_folder_query() {
        let json = r#"{"success":true,"message":null,"error":null,"data":{"files":[
            {"id":1,"filename":"a.txt","file_size":10,"folder_id":9,"owner_id":1},
            {"id":2,"filename":"b.png","file_size":20,"folder_id":9,"owner_id":1}
        ],"count":2}}"#;
        let (url, handle) = mock_server(200, json).await;

        let files = client(url).list_files(Some(9)).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.txt");

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/files?folder_id=9 "), "{request}");
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn list_folders_root_has_no_query() {
        let json = r#"{"success":true,"data":{"folders":[{"id":3,"folder_name":"Docs","owner_id":1}]}}"#;
        let (url, handle) = mock_server(200, json).await;

        let folders = client(url).list_folders(None).await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "Docs");

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/folders HTTP/1.1"), "{request}");
    }

    #[tokio::test]
    async fn server_error_uses_envelope_text() {
        let json = r#"{"success":false,"data":null,"error":"folder not found"}"#;
        let (url, handle) = mock_server(404, json).await;

        let err = client(url).list_files(Some(1)).await.unwrap_err();
        match &err {
            EndpointError::Server { code, message } => {
                assert_eq!(*code, 404);
                assert_eq!(message, "folder not found");
            }
            other => panic!("unexpected: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_body_is_protocol_error() {
        let (url, handle) = mock_server(200, "<html>oops</html>").await;

        let err = client(url).list_folders(None).await.unwrap_err();
        match err {
            EndpointError::Protocol { body, .. } => assert!(body.contains("oops")),
            other => panic!("unexpected: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn upload_sends_multipart_fields_and_reports_progress() {
        let json = r#"{"success":true,"message":"ok","error":null,
            "data":{"id":42,"filename":"notes.txt","file_size":5,"folder_id":7,"owner_id":1}}"#;
        let (url, handle) = mock_server(201, json).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let on_progress: ProgressFn = Arc::new(move |sent, total| {
            seen_cb.lock().unwrap().push((sent, total));
        });

        let request = UploadRequest {
            name: "notes.txt".into(),
            size_hint: 5,
            folder_id: Some(7),
            content: single_chunk(b"hello"),
        };
        let file = client(url).upload(request, on_progress).await.unwrap();
        assert_eq!(file.id, 42);
        assert_eq!(file.parent_folder_id, Some(7));

        assert_eq!(seen.lock().unwrap().last(), Some(&(5, 5)));

        let raw = handle.await.unwrap();
        assert!(raw.starts_with("POST /api/upload "), "{raw}");
        assert!(raw.contains("name=\"file\"; filename=\"notes.txt\""));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("name=\"original_filename\""));
        assert!(raw.contains("name=\"folder_id\"\r\n\r\n7"));
        assert!(raw.contains("hello"));
    }

    #[tokio::test]
    async fn upload_413_has_friendly_message() {
        let (url, handle) = mock_server(413, "Request Entity Too Large").await;

        let request = UploadRequest {
            name: "big.zip".into(),
            size_hint: 3,
            folder_id: None,
            content: single_chunk(b"abc"),
        };
        let err = client(url)
            .upload(request, Arc::new(|_, _| {}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(413));
        assert!(err.to_string().contains("size limit"));
        handle.abort();
    }

    #[tokio::test]
    async fn download_streams_body_with_length() {
        let (url, handle) = mock_server(200, "0123456789").await;

        let mut download = client(url).download(5).await.unwrap();
        assert_eq!(download.total_bytes, Some(10));

        let mut received = Vec::new();
        while let Some(chunk) = download.body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"0123456789");

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/files/5/download "), "{request}");
    }

    #[tokio::test]
    async fn download_without_response_times_out() {
        let (url, handle) = silent_server().await;

        let result = tokio::time::timeout(Duration::from_secs(5), impatient_client(url).download(5))
            .await
            .expect("download must give up on its own");
        match result {
            Err(EndpointError::Network(msg)) => assert!(msg.contains("no response"), "{msg}"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("silent server produced a download"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn upload_without_response_times_out() {
        let (url, handle) = silent_server().await;

        let request = UploadRequest {
            name: "notes.txt".into(),
            size_hint: 5,
            folder_id: None,
            content: single_chunk(b"hello"),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            impatient_client(url).upload(request, Arc::new(|_, _| {})),
        )
        .await
        .expect("upload must give up on its own");
        assert!(matches!(result, Err(EndpointError::Network(_))), "{result:?}");
        handle.abort();
    }

    #[tokio::test]
    async fn upload_with_stalled_source_times_out() {
        let (url, handle) = silent_server().await;

        let first = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"he"))]);
        let content: ByteStream = Box::pin(first.chain(futures_util::stream::pending()));
        let request = UploadRequest {
            name: "notes.txt".into(),
            size_hint: 5,
            folder_id: None,
            content,
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            impatient_client(url).upload(request, Arc::new(|_, _| {})),
        )
        .await
        .expect("upload must give up on its own");
        match result {
            Err(EndpointError::Network(msg)) => assert!(msg.contains("stalled"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn probe_reports_health() {
        let (url, handle) = mock_server(200, r#"{"status":"healthy"}"#).await;
        assert!(client(url).probe().await);
        handle.abort();

        let (url, handle) = mock_server(503, "").await;
        assert!(!client(url).probe().await);
        handle.abort();
    }

    #[tokio::test]
    async fn probe_unreachable_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpClient::new(ClientSettings {
            base_url: format!("http://127.0.0.1:{port}/api"),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();
        assert!(!client.probe().await);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpClient::new(ClientSettings {
            base_url: "http://host/api/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://host/api");
    }

    #[test]
    fn invalid_token_is_rejected() {
        let result = HttpClient::new(ClientSettings {
            token: Some("bad\ntoken".into()),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
