//! Concurrent upload/download manager with pause, resume, retry and cancel.
//!
//! [`TransferManager`] owns every transfer task. Each task is driven by at
//! most one worker run at a time; state changes are published as
//! [`TransferEvent`]s to registered observers through a single dispatcher.

mod destination;
mod manager;
mod progress;
mod task;
mod types;
mod upload_center;
mod validation;
mod worker;

#[cfg(test)]
mod test_support;

pub use destination::{Destination, DownloadTarget, ManagedLocation, ManagedWriter, resolve_destination};
pub use manager::{ManagerConfig, TransferManager};
pub use progress::{ThroughputMeter, percent};
pub use types::{
    Direction, ObserverId, RequestOutcome, TransferEvent, TransferObserver, TransferRequest,
    TransferSnapshot, TransferSource, TransferStatus,
};
pub use upload_center::{UploadProgress, UploadProgressCenter};
pub use validation::validate_file_name;

use clouddisk_api::EndpointError;

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Read size for upload sources.
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("unknown transfer: {0}")]
    UnknownTask(i64),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
