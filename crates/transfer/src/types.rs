//! Public types for the transfer manager.

use std::path::PathBuf;

use clouddisk_api::FileDescriptor;
use serde::Serialize;

use crate::destination::DownloadTarget;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

/// Lifecycle state of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Registered, waiting for a concurrency permit.
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Completed and Failed only change through an explicit command.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What to transfer.
#[derive(Debug, Clone)]
pub enum TransferSource {
    /// Fetch remote file `resource_id` into `target`.
    Download { target: DownloadTarget },
    /// Send a local file into `folder_id` (`None` = root).
    Upload {
        path: PathBuf,
        folder_id: Option<i64>,
    },
}

impl TransferSource {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Download { .. } => Direction::Download,
            Self::Upload { .. } => Direction::Upload,
        }
    }
}

/// A request to start a transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Remote file id for downloads; local id for uploads.
    pub resource_id: i64,
    pub display_name: String,
    pub source: TransferSource,
}

/// Result of [`TransferManager::request_transfer`](crate::TransferManager::request_transfer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Started,
    /// A non-terminal task already exists for the id; nothing changed.
    AlreadyActive(TransferStatus),
}

/// Observable state of one transfer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub resource_id: i64,
    pub display_name: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    /// Zero while unknown.
    pub bytes_total: u64,
    pub progress: u8,
    /// Bytes per second from the latest sample.
    pub throughput: u64,
    pub error: Option<String>,
    /// Upload source, or the file written by a path-strategy download.
    pub local_path: Option<PathBuf>,
    /// Destination folder of an upload.
    pub target_folder: Option<i64>,
    /// Descriptor returned by a completed upload.
    pub remote_file: Option<FileDescriptor>,
}

impl TransferSnapshot {
    pub(crate) fn new(request: &TransferRequest) -> Self {
        let (local_path, target_folder) = match &request.source {
            TransferSource::Download { .. } => (None, None),
            TransferSource::Upload { path, folder_id } => (Some(path.clone()), *folder_id),
        };
        Self {
            resource_id: request.resource_id,
            display_name: request.display_name.clone(),
            direction: request.source.direction(),
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            bytes_total: 0,
            progress: 0,
            throughput: 0,
            error: None,
            local_path,
            target_folder,
            remote_file: None,
        }
    }
}

/// A change published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Added(TransferSnapshot),
    Updated(TransferSnapshot),
    Removed { resource_id: i64 },
}

impl TransferEvent {
    pub fn resource_id(&self) -> i64 {
        match self {
            Self::Added(s) | Self::Updated(s) => s.resource_id,
            Self::Removed { resource_id } => *resource_id,
        }
    }

    /// The snapshot carried by added and updated events.
    pub fn snapshot(&self) -> Option<&TransferSnapshot> {
        match self {
            Self::Added(s) | Self::Updated(s) => Some(s),
            Self::Removed { .. } => None,
        }
    }
}

/// Receives transfer events on the manager's dispatcher task.
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);
