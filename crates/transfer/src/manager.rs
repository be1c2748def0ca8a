//! Transfer manager: task registry, commands and observer fan-out.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use clouddisk_api::TransferEndpoint;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::destination::DownloadTarget;
use crate::task::{RunContext, TransferTask};
use crate::types::{
    ObserverId, RequestOutcome, TransferEvent, TransferObserver, TransferRequest, TransferSnapshot,
    TransferSource, TransferStatus,
};
use crate::validation::validate_file_name;
use crate::{DEFAULT_MAX_CONCURRENT, TransferError, lock};

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workers allowed to transfer at the same time.
    pub max_concurrent: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Weak<dyn TransferObserver>)>,
    subscribers: Vec<mpsc::UnboundedSender<TransferEvent>>,
}

/// Owns every transfer task and relays their state changes.
///
/// Must be created inside a Tokio runtime: construction spawns the event
/// dispatcher.
pub struct TransferManager {
    ctx: Arc<RunContext>,
    tasks: Mutex<BTreeMap<i64, Arc<TransferTask>>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    registry: Arc<Mutex<Registry>>,
    next_local_id: AtomicI64,
}

impl TransferManager {
    pub fn new(endpoint: Arc<dyn TransferEndpoint>, config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(Registry::default()));
        tokio::spawn(dispatch(events_rx, Arc::clone(&registry)));

        Self {
            ctx: Arc::new(RunContext {
                endpoint,
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            }),
            tasks: Mutex::new(BTreeMap::new()),
            events_tx,
            registry,
            next_local_id: AtomicI64::new(-1),
        }
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Registers and starts a transfer.
    ///
    /// A terminal task with the same id is replaced (publishing its removal
    /// first); a non-terminal one is left untouched.
    pub fn request_transfer(&self, request: TransferRequest) -> RequestOutcome {
        let id = request.resource_id;
        let task = {
            let mut tasks = lock(&self.tasks);
            if let Some(existing) = tasks.get(&id) {
                let status = existing.status();
                if !status.is_terminal() {
                    debug!(id, ?status, "transfer already active");
                    return RequestOutcome::AlreadyActive(status);
                }
                existing.retire();
                tasks.remove(&id);
            }

            let task = TransferTask::new(request, self.events_tx.clone());
            tasks.insert(id, Arc::clone(&task));
            task
        };

        info!(id, name = task.name(), direction = ?task.source().direction(), "transfer requested");
        task.start(&self.ctx);
        RequestOutcome::Started
    }

    /// Downloads remote file `file_id` as `name` into `target`.
    pub fn request_download(&self, file_id: i64, name: impl Into<String>, target: DownloadTarget) -> RequestOutcome {
        self.request_transfer(TransferRequest {
            resource_id: file_id,
            display_name: name.into(),
            source: TransferSource::Download { target },
        })
    }

    /// Uploads the local file at `path` into `folder_id`.
    ///
    /// `name` defaults to the file name of `path`. Returns the local id
    /// allocated for the task.
    pub async fn request_upload(
        &self,
        path: impl Into<PathBuf>,
        name: Option<String>,
        folder_id: Option<i64>,
    ) -> Result<(i64, RequestOutcome), TransferError> {
        let path = path.into();
        let name = match name {
            Some(name) => name,
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_file_name(&name)?;

        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }

        let id = self.next_local_id.fetch_sub(1, Ordering::Relaxed);
        let outcome = self.request_transfer(TransferRequest {
            resource_id: id,
            display_name: name,
            source: TransferSource::Upload { path, folder_id },
        });
        Ok((id, outcome))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn task(&self, id: i64) -> Option<Arc<TransferTask>> {
        lock(&self.tasks).get(&id).cloned()
    }

    /// Running → pause, Paused → resume, Failed → retry.
    ///
    /// Anything else, unknown ids included, is a silent no-op.
    pub fn toggle(&self, id: i64) -> bool {
        self.task(id).is_some_and(|task| task.toggle(&self.ctx))
    }

    /// Pauses a running transfer. `Ok(false)` when it is not running.
    pub fn pause(&self, id: i64) -> Result<bool, TransferError> {
        let task = self.task(id).ok_or(TransferError::UnknownTask(id))?;
        Ok(task.pause())
    }

    /// Resumes a paused transfer from byte 0. `Ok(false)` when not paused.
    pub fn resume(&self, id: i64) -> Result<bool, TransferError> {
        let task = self.task(id).ok_or(TransferError::UnknownTask(id))?;
        Ok(task.resume(&self.ctx))
    }

    /// Restarts a failed transfer. `Ok(false)` when it has not failed.
    pub fn retry(&self, id: i64) -> Result<bool, TransferError> {
        let task = self.task(id).ok_or(TransferError::UnknownTask(id))?;
        Ok(task.retry(&self.ctx))
    }

    /// Cancels and forgets a transfer. Returns whether it existed.
    pub fn remove(&self, id: i64) -> bool {
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.remove(&id) else {
            return false;
        };
        // Retired under the registry lock so a replacement registered for
        // the same id publishes its events after this removal.
        task.retire();
        drop(tasks);
        debug!(id, "transfer removed");
        true
    }

    /// Removes each id in turn; returns how many existed.
    pub fn remove_many(&self, ids: &[i64]) -> usize {
        ids.iter().filter(|&&id| self.remove(id)).count()
    }

    /// Removes every completed transfer; returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, task| {
            if task.status() != TransferStatus::Completed {
                return true;
            }
            task.retire();
            false
        });
        let removed = before - tasks.len();
        drop(tasks);
        debug!(removed, "finished transfers cleared");
        removed
    }

    /// Snapshots of all transfers, ordered by id.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.iter().map(|t| t.snapshot()).collect()
    }

    pub fn get(&self, id: i64) -> Option<TransferSnapshot> {
        self.task(id).map(|t| t.snapshot())
    }

    /// Whether any transfer is queued, running or paused.
    pub fn has_active(&self) -> bool {
        let tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        tasks.iter().any(|t| !t.status().is_terminal())
    }

    /// Cancels every worker. Tasks stay registered with their last state.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = lock(&self.tasks).values().cloned().collect();
        for task in &tasks {
            task.halt();
        }
        info!(count = tasks.len(), "transfer manager shut down");
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers an observer. The manager keeps only a weak reference.
    pub fn add_observer(&self, observer: &Arc<dyn TransferObserver>) -> ObserverId {
        let mut reg = lock(&self.registry);
        reg.next_id += 1;
        let id = ObserverId(reg.next_id);
        reg.observers.push((id, Arc::downgrade(observer)));
        id
    }

    /// Unregisters an observer. Returns whether it was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut reg = lock(&self.registry);
        let before = reg.observers.len();
        reg.observers.retain(|(oid, _)| *oid != id);
        reg.observers.len() != before
    }

    /// Returns a channel receiving every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry).subscribers.push(tx);
        rx
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        for task in lock(&self.tasks).values() {
            task.halt();
        }
    }
}

/// Delivers queued events to observers and subscribers in order.
async fn dispatch(mut events: mpsc::UnboundedReceiver<TransferEvent>, registry: Arc<Mutex<Registry>>) {
    while let Some(event) = events.recv().await {
        let (observers, subscribers) = {
            let mut reg = lock(&registry);
            reg.observers.retain(|(_, weak)| weak.strong_count() > 0);
            let observers: Vec<Arc<dyn TransferObserver>> =
                reg.observers.iter().filter_map(|(_, weak)| weak.upgrade()).collect();
            (observers, reg.subscribers.clone())
        };

        // The registry lock is released so observers may (un)register.
        for observer in observers {
            observer.on_event(&event);
        }

        let mut closed = false;
        for tx in &subscribers {
            closed |= tx.send(event.clone()).is_err();
        }
        if closed {
            lock(&registry).subscribers.retain(|tx| !tx.is_closed());
        }
    }
    debug!("transfer event dispatcher stopped");
}
