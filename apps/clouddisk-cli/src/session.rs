//! Composition root: one endpoint, one transfer manager, one listing cache
//! and one upload indicator, wired together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clouddisk_api::{FolderListing, TransferEndpoint, fetch_listing, try_fetch_listing};
use clouddisk_listing_cache::{FolderKey, ListingCache, MissPolicy};
use clouddisk_transfer::{
    Direction, DownloadTarget, ObserverId, RequestOutcome, TransferEvent, TransferManager,
    TransferObserver, TransferSnapshot, TransferStatus, UploadProgressCenter,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;

/// Keeps the listing cache and the upload indicator in step with transfers.
struct SessionObserver {
    cache: ListingCache,
    uploads: UploadProgressCenter,
}

impl TransferObserver for SessionObserver {
    fn on_event(&self, event: &TransferEvent) {
        let Some(snapshot) = event.snapshot() else {
            return;
        };
        if snapshot.direction != Direction::Upload {
            return;
        }

        match snapshot.status {
            TransferStatus::Running => {
                let current = self.uploads.current();
                if current.file_name.as_deref() != Some(snapshot.display_name.as_str()) {
                    self.uploads.start(snapshot.display_name.clone());
                }
                self.uploads.update(i64::from(snapshot.progress));
            }
            TransferStatus::Completed => {
                self.uploads.finish();
                // The folder gained a file; its cached listing is stale.
                if self.cache.invalidate(snapshot.target_folder) {
                    debug!(folder = ?snapshot.target_folder, "listing invalidated after upload");
                }
            }
            TransferStatus::Paused | TransferStatus::Failed => self.uploads.finish(),
            TransferStatus::Queued => {}
        }
    }
}

pub struct Session {
    endpoint: Arc<dyn TransferEndpoint>,
    manager: TransferManager,
    cache: ListingCache,
    uploads: UploadProgressCenter,
    download_dir: PathBuf,
    // Observers are held weakly by the manager.
    _observer: Arc<dyn TransferObserver>,
    observer_id: ObserverId,
}

impl Session {
    /// Must be called inside a Tokio runtime.
    pub fn new(endpoint: Arc<dyn TransferEndpoint>, config: &ClientConfig) -> Self {
        let manager = TransferManager::new(Arc::clone(&endpoint), config.manager_config());
        let cache = ListingCache::new(config.listing_cache_capacity, MissPolicy::Coalesce);
        let uploads = UploadProgressCenter::new();

        let observer: Arc<dyn TransferObserver> = Arc::new(SessionObserver {
            cache: cache.clone(),
            uploads: uploads.clone(),
        });
        let observer_id = manager.add_observer(&observer);

        Self {
            endpoint,
            manager,
            cache,
            uploads,
            download_dir: PathBuf::from(&config.download_dir),
            _observer: observer,
            observer_id,
        }
    }

    #[cfg(test)]
    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ListingCache {
        &self.cache
    }

    pub fn uploads(&self) -> &UploadProgressCenter {
        &self.uploads
    }

    /// Contents of `folder`, served from the cache when possible.
    ///
    /// A first visit degrades to an empty listing when the server is
    /// unreachable. A background refresh of a cached folder that fails on
    /// both halves keeps the cached listing instead.
    pub async fn listing(&self, folder: FolderKey) -> anyhow::Result<FolderListing> {
        self.cache.set_viewing(folder);
        let cached = self.cache.get(folder).is_some();
        let endpoint = Arc::clone(&self.endpoint);
        let listing = self
            .cache
            .get_or_fetch(folder, move || async move {
                if cached {
                    try_fetch_listing(endpoint.as_ref(), folder).await
                } else {
                    Ok(fetch_listing(endpoint.as_ref(), folder).await)
                }
            })
            .await
            .with_context(|| format!("listing folder {}", folder_label(folder)))?;
        Ok(listing)
    }

    /// Queues downloads of `file_ids`, which must be files of `folder`.
    ///
    /// Returns the ids that were started.
    pub async fn download(
        &self,
        file_ids: &[i64],
        folder: FolderKey,
        dir: Option<PathBuf>,
    ) -> anyhow::Result<Vec<i64>> {
        let listing = self.listing(folder).await?;
        let dir = dir.unwrap_or_else(|| self.download_dir.clone());

        let mut started = Vec::new();
        for &id in file_ids {
            let Some(file) = listing.files.iter().find(|f| f.id == id) else {
                bail!("file {id} not found in folder {}", folder_label(folder));
            };
            match self
                .manager
                .request_download(id, file.name.clone(), DownloadTarget::directory(&dir))
            {
                RequestOutcome::Started => {
                    info!(id, name = %file.name, dir = %dir.display(), "download queued");
                    started.push(id);
                }
                RequestOutcome::AlreadyActive(status) => {
                    warn!(id, ?status, "download already in progress");
                }
            }
        }
        Ok(started)
    }

    /// Queues uploads of `paths` into `folder`. Returns the local task ids.
    pub async fn upload(&self, paths: &[PathBuf], folder: FolderKey) -> anyhow::Result<Vec<i64>> {
        let mut started = Vec::new();
        for path in paths {
            let (id, _) = self
                .manager
                .request_upload(path.clone(), None, folder)
                .await
                .with_context(|| format!("cannot upload {}", path.display()))?;
            info!(id, path = %path.display(), folder = ?folder, "upload queued");
            started.push(id);
        }
        Ok(started)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.manager.subscribe()
    }

    /// Waits until every task in `ids` is terminal, reporting each change.
    ///
    /// Returns the final snapshots in `ids` order.
    pub async fn wait(
        &self,
        ids: &[i64],
        events: &mut mpsc::UnboundedReceiver<TransferEvent>,
        mut report: impl FnMut(&TransferSnapshot),
    ) -> Vec<TransferSnapshot> {
        let mut last: HashMap<i64, (TransferStatus, u8)> = HashMap::new();

        while !self.all_terminal(ids) {
            let Some(event) = events.recv().await else {
                break;
            };
            let Some(snapshot) = event.snapshot() else {
                continue;
            };
            if !ids.contains(&snapshot.resource_id) {
                continue;
            }
            let key = (snapshot.status, snapshot.progress);
            if last.insert(snapshot.resource_id, key) != Some(key) {
                report(snapshot);
            }
        }

        ids.iter().filter_map(|&id| self.manager.get(id)).collect()
    }

    fn all_terminal(&self, ids: &[i64]) -> bool {
        ids.iter().all(|&id| {
            self.manager
                .get(id)
                .is_none_or(|s| s.status.is_terminal())
        })
    }

    /// Stops every transfer.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.manager.remove_observer(self.observer_id);
    }
}

pub fn folder_label(folder: FolderKey) -> String {
    match folder {
        Some(id) => id.to_string(),
        None => "root".into(),
    }
}
