//! Download destination resolution.
//!
//! A download either goes to a managed storage location (an opaque,
//! permission-scoped sink) or to a file inside a local directory. Exactly one
//! strategy is picked per run, before any network I/O.
//!
//! Directory downloads are written to a `<name>.part` sibling and only
//! renamed onto `<name>` once complete, so a failed or interrupted run never
//! touches a file that already exists there.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use clouddisk_api::EndpointError;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Byte sink handed out by a [`ManagedLocation`].
pub type ManagedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A storage location the process may write into without a direct
/// filesystem path.
pub trait ManagedLocation: Send + Sync {
    /// Human-readable description for logs.
    fn label(&self) -> String;

    /// Whether the location currently accepts writes.
    fn is_writable(&self) -> bool;

    /// Creates `name`, replacing any existing entry with the same name.
    fn create_file<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<ManagedWriter>> + Send + 'a>>;
}

/// Where a download should land.
#[derive(Clone, Default)]
pub struct DownloadTarget {
    pub managed: Option<Arc<dyn ManagedLocation>>,
    pub directory: Option<PathBuf>,
}

impl DownloadTarget {
    /// A target that writes into `dir`, creating it when missing.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            managed: None,
            directory: Some(dir.into()),
        }
    }

    /// A target that prefers `location` and falls back to `fallback_dir`.
    pub fn managed(location: Arc<dyn ManagedLocation>, fallback_dir: Option<PathBuf>) -> Self {
        Self {
            managed: Some(location),
            directory: fallback_dir,
        }
    }
}

impl fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTarget")
            .field("managed", &self.managed.as_ref().map(|m| m.label()))
            .field("directory", &self.directory)
            .finish()
    }
}

/// An opened download destination.
pub enum Destination {
    Managed { label: String, writer: ManagedWriter },
    Path {
        path: PathBuf,
        part: PathBuf,
        file: tokio::fs::File,
    },
}

impl Destination {
    /// The file the download ends up in, for the path strategy.
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Managed { .. } => None,
            Self::Path { path, .. } => Some(path),
        }
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Managed { writer, .. } => writer.write_all(data).await,
            Self::Path { file, .. } => file.write_all(data).await,
        }
    }

    /// Flushes buffered data and, for the path strategy, moves the part
    /// file into place.
    pub async fn finish(&mut self) -> std::io::Result<()> {
        match self {
            Self::Managed { writer, .. } => writer.shutdown().await,
            Self::Path { path, part, file } => {
                file.flush().await?;
                tokio::fs::rename(&*part, &*path).await
            }
        }
    }

    /// Drops the destination, deleting the part file if one was written.
    pub async fn discard(self) {
        match self {
            Self::Managed { label, .. } => {
                debug!(location = %label, "discarding managed destination");
            }
            Self::Path { part, file, .. } => {
                drop(file);
                match tokio::fs::remove_file(&part).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %part.display(), error = %e, "failed to remove partial download");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed { label, .. } => f.debug_struct("Managed").field("label", label).finish(),
            Self::Path { path, .. } => f.debug_struct("Path").field("path", path).finish(),
        }
    }
}

/// Opens the destination for `file_name`.
///
/// The managed location wins when present, writable and able to create the
/// file; otherwise the directory is used, creating it if needed. `file_name`
/// must already be validated.
pub async fn resolve_destination(
    target: &DownloadTarget,
    file_name: &str,
) -> Result<Destination, EndpointError> {
    if let Some(location) = &target.managed {
        let label = location.label();
        if location.is_writable() {
            match location.create_file(file_name).await {
                Ok(writer) => {
                    debug!(location = %label, file = file_name, "using managed location");
                    return Ok(Destination::Managed { label, writer });
                }
                Err(e) => {
                    warn!(location = %label, error = %e, "managed location refused file, falling back");
                }
            }
        } else {
            debug!(location = %label, "managed location not writable");
        }
    }

    if let Some(dir) = &target.directory {
        match open_in_directory(dir, file_name).await {
            Ok(dest) => return Ok(dest),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "download directory unusable");
            }
        }
    }

    Err(EndpointError::DestinationUnwritable(
        "no destination resolvable".into(),
    ))
}

async fn open_in_directory(dir: &Path, file_name: &str) -> std::io::Result<Destination> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let part = dir.join(format!("{file_name}.part"));
    let file = tokio::fs::File::create(&part).await?;
    debug!(path = %path.display(), "using download directory");
    Ok(Destination::Path { path, part, file })
}
