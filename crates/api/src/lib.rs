//! Remote file store access for CloudDisk transfers.
//!
//! The [`TransferEndpoint`] trait is the contract the transfer manager and
//! the listing cache are written against. [`HttpClient`] implements it on top
//! of `reqwest` with bearer authentication; tests substitute in-memory fakes.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod listing;
pub mod types;

pub use client::{ClientSettings, HttpClient};
pub use endpoint::{ByteStream, Download, EndpointFuture, ProgressFn, TransferEndpoint, UploadRequest};
pub use error::EndpointError;
pub use listing::{fetch_listing, try_fetch_listing};
pub use types::{FileDescriptor, FolderDescriptor, FolderListing, format_size, mime_for_name};

use std::time::Duration;

/// Default timeout for general API calls (connect, per-chunk read, listing).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for the connectivity probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
