//! In-memory endpoint and storage fakes for transfer tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use clouddisk_api::{
    Download, EndpointError, EndpointFuture, FileDescriptor, FolderDescriptor, ProgressFn,
    TransferEndpoint, UploadRequest,
};
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tokio::sync::{Semaphore, mpsc};

use crate::destination::{ManagedLocation, ManagedWriter};
use crate::types::TransferEvent;

/// Sender half feeding one download body.
pub type Feed = mpsc::UnboundedSender<Result<Bytes, EndpointError>>;

/// Endpoint whose download bodies are fed by the test.
///
/// Each `download` call hands a fresh [`Feed`] to the receiver returned by
/// [`ScriptedEndpoint::new`]; dropping the feed ends the body. Uploads read
/// their content freely unless [`ScriptedEndpoint::gate_uploads`] was called.
pub struct ScriptedEndpoint {
    total: Option<u64>,
    opened: mpsc::UnboundedSender<Feed>,
    next_error: Mutex<Option<EndpointError>>,
    download_calls: AtomicUsize,
    uploads: Mutex<Vec<(String, Option<i64>, u64)>>,
    upload_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedEndpoint {
    pub fn new(total: Option<u64>) -> (Arc<Self>, mpsc::UnboundedReceiver<Feed>) {
        let (opened, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            total,
            opened,
            next_error: Mutex::new(None),
            download_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            upload_gate: Mutex::new(None),
        });
        (endpoint, rx)
    }

    /// Makes the next `download` call fail with `err`.
    pub fn fail_next_download(&self, err: EndpointError) {
        *self.next_error.lock().unwrap() = Some(err);
    }

    /// From now on each upload waits for a permit of the returned semaphore
    /// after every chunk it has read. The semaphore starts empty.
    pub fn gate_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.upload_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    /// `(name, folder_id, bytes received)` per completed upload.
    pub fn uploads(&self) -> Vec<(String, Option<i64>, u64)> {
        self.uploads.lock().unwrap().clone()
    }
}

impl TransferEndpoint for ScriptedEndpoint {
    fn upload(&self, request: UploadRequest, on_progress: ProgressFn) -> EndpointFuture<'_, FileDescriptor> {
        Box::pin(async move {
            let UploadRequest {
                name,
                size_hint,
                folder_id,
                mut content,
            } = request;
            let mut sent = 0u64;
            while let Some(chunk) = content.next().await {
                sent += chunk?.len() as u64;
                on_progress(sent, size_hint);
                let gate = self.upload_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
            }
            self.uploads
                .lock()
                .unwrap()
                .push((name.clone(), folder_id, sent));
            Ok(FileDescriptor {
                id: 77,
                name,
                size: sent,
                parent_folder_id: folder_id,
                ..Default::default()
            })
        })
    }

    fn download(&self, _file_id: i64) -> EndpointFuture<'_, Download> {
        Box::pin(async move {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.next_error.lock().unwrap().take() {
                return Err(err);
            }
            let (feed, rx) = mpsc::unbounded_channel();
            let _ = self.opened.send(feed);
            let body = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Download {
                total_bytes: self.total,
                body: Box::pin(body),
            })
        })
    }

    fn list_folders(&self, _parent_id: Option<i64>) -> EndpointFuture<'_, Vec<FolderDescriptor>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn list_files(&self, _folder_id: Option<i64>) -> EndpointFuture<'_, Vec<FileDescriptor>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// A body chunk of `len` bytes.
pub fn chunk(len: usize) -> Bytes {
    Bytes::from(vec![0xAB; len])
}

/// Next event of any task, failing the test after 5 s.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<TransferEvent>) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Next event for task `id`, skipping other tasks.
pub async fn next_for(events: &mut mpsc::UnboundedReceiver<TransferEvent>, id: i64) -> TransferEvent {
    loop {
        let event = next_event(events).await;
        if event.resource_id() == id {
            return event;
        }
    }
}

/// Polls `cond` until it holds, failing the test after 5 s.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Managed location backed by a map of file name to contents.
pub struct MemoryLocation {
    writable: bool,
    refuse_create: bool,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryLocation {
    pub fn new(writable: bool) -> Self {
        Self {
            writable,
            refuse_create: false,
            files: Arc::default(),
        }
    }

    /// Claims to be writable but refuses to create files.
    pub fn failing() -> Self {
        Self {
            refuse_create: true,
            ..Self::new(true)
        }
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }
}

impl ManagedLocation for MemoryLocation {
    fn label(&self) -> String {
        "memory".into()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn create_file<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<ManagedWriter>> + Send + 'a>> {
        Box::pin(async move {
            if self.refuse_create {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "permission revoked",
                ));
            }
            self.files.lock().unwrap().insert(name.to_string(), Vec::new());
            let writer: ManagedWriter = Box::new(MemoryWriter {
                name: name.to_string(),
                files: Arc::clone(&self.files),
            });
            Ok(writer)
        })
    }
}

struct MemoryWriter {
    name: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.files
            .lock()
            .unwrap()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
