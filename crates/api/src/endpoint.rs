//! Transfer endpoint contract.
//!
//! The manager and the listing cache only see this trait. The HTTP client
//! implements it for the real server; tests implement it in memory.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::EndpointError;
use crate::types::{FileDescriptor, FolderDescriptor};

/// A stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, EndpointError>> + Send>>;

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Boxed future returned by endpoint methods.
pub type EndpointFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EndpointError>> + Send + 'a>>;

/// A file to upload.
pub struct UploadRequest {
    /// Name the file gets on the server.
    pub name: String,
    /// Total size in bytes, used for the multipart length and progress.
    pub size_hint: u64,
    /// Destination folder; `None` uploads to the root.
    pub folder_id: Option<i64>,
    pub content: ByteStream,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("name", &self.name)
            .field("size_hint", &self.size_hint)
            .field("folder_id", &self.folder_id)
            .finish_non_exhaustive()
    }
}

/// An open download: the announced length and the body stream.
pub struct Download {
    /// `None` when the server did not send a usable content length.
    pub total_bytes: Option<u64>,
    pub body: ByteStream,
}

/// Remote store operations used by transfers and listings.
pub trait TransferEndpoint: Send + Sync {
    /// Uploads a file, reporting bytes sent through `on_progress`.
    fn upload(&self, request: UploadRequest, on_progress: ProgressFn) -> EndpointFuture<'_, FileDescriptor>;

    /// Opens a streaming download of a file.
    fn download(&self, file_id: i64) -> EndpointFuture<'_, Download>;

    /// Lists the sub-folders of `parent_id` (`None` = root).
    fn list_folders(&self, parent_id: Option<i64>) -> EndpointFuture<'_, Vec<FolderDescriptor>>;

    /// Lists the files in `folder_id` (`None` = root).
    fn list_files(&self, folder_id: Option<i64>) -> EndpointFuture<'_, Vec<FileDescriptor>>;
}
