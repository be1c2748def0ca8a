//! Shared "current upload" indicator.

use std::sync::Arc;

use tokio::sync::watch;

/// State of the upload currently shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub uploading: bool,
    pub file_name: Option<String>,
    /// 0–100.
    pub progress: u8,
}

/// Publishes the current upload state to any number of subscribers.
///
/// New subscribers see the latest state immediately.
#[derive(Debug, Clone)]
pub struct UploadProgressCenter {
    tx: Arc<watch::Sender<UploadProgress>>,
}

impl Default for UploadProgressCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadProgressCenter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(UploadProgress::default());
        Self { tx: Arc::new(tx) }
    }

    /// Marks `file_name` as uploading at 0%.
    pub fn start(&self, file_name: impl Into<String>) {
        self.tx.send_replace(UploadProgress {
            uploading: true,
            file_name: Some(file_name.into()),
            progress: 0,
        });
    }

    /// Sets the progress of the current upload, clamped to 0–100.
    pub fn update(&self, progress: i64) {
        let progress = progress.clamp(0, 100) as u8;
        self.tx.send_modify(|state| {
            state.uploading = true;
            state.progress = progress;
        });
    }

    /// Clears the indicator.
    pub fn finish(&self) {
        self.tx.send_replace(UploadProgress::default());
    }

    pub fn current(&self) -> UploadProgress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.tx.subscribe()
    }
}
