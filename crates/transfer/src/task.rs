//! Transfer task state machine.
//!
//! A task is mutated only by manager commands and by its current worker run.
//! Every run carries a generation number; writes from a run whose generation
//! is no longer current are dropped. Events are enqueued while the state lock
//! is held so that per-task order matches mutation order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clouddisk_api::{FileDescriptor, TransferEndpoint};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::lock;
use crate::progress::{ThroughputMeter, percent};
use crate::types::{TransferEvent, TransferRequest, TransferSnapshot, TransferSource, TransferStatus};
use crate::worker;

/// Resources shared by every worker run.
pub(crate) struct RunContext {
    pub endpoint: Arc<dyn TransferEndpoint>,
    pub permits: Arc<Semaphore>,
}

/// Pause flag and cancellation token of one worker run.
#[derive(Clone)]
pub(crate) struct RunControl {
    generation: u64,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl RunControl {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

struct ActiveRun {
    control: RunControl,
    handle: JoinHandle<()>,
}

struct TaskState {
    snapshot: TransferSnapshot,
    generation: u64,
    run: Option<ActiveRun>,
    meter: ThroughputMeter,
    removed: bool,
}

impl TaskState {
    fn is_current(&self, run: &RunControl) -> bool {
        !self.removed && self.generation == run.generation && !run.is_cancelled()
    }

    fn reset_counters(&mut self) {
        self.snapshot.bytes_transferred = 0;
        self.snapshot.progress = 0;
        self.snapshot.throughput = 0;
    }
}

/// One managed transfer.
pub(crate) struct TransferTask {
    id: i64,
    name: String,
    source: TransferSource,
    events: mpsc::UnboundedSender<TransferEvent>,
    state: Mutex<TaskState>,
}

impl TransferTask {
    /// Creates a queued task and publishes [`TransferEvent::Added`].
    pub fn new(request: TransferRequest, events: mpsc::UnboundedSender<TransferEvent>) -> Arc<Self> {
        let snapshot = TransferSnapshot::new(&request);
        let task = Arc::new(Self {
            id: request.resource_id,
            name: request.display_name,
            source: request.source,
            events,
            state: Mutex::new(TaskState {
                snapshot,
                generation: 0,
                run: None,
                meter: ThroughputMeter::new(Instant::now()),
                removed: false,
            }),
        });
        {
            let state = lock(&task.state);
            let _ = task.events.send(TransferEvent::Added(state.snapshot.clone()));
        }
        task
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &TransferSource {
        &self.source
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        lock(&self.state).snapshot.clone()
    }

    pub fn status(&self) -> TransferStatus {
        lock(&self.state).snapshot.status
    }

    fn publish(&self, state: &TaskState) {
        let _ = self.events.send(TransferEvent::Updated(state.snapshot.clone()));
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Starts a run from byte 0 unless one is already in flight.
    pub fn start(self: &Arc<Self>, ctx: &Arc<RunContext>) -> bool {
        let mut state = lock(&self.state);
        if state.removed {
            return false;
        }
        if state.run.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            debug!(id = self.id, "start ignored, worker already running");
            return false;
        }
        self.launch(&mut state, ctx);
        true
    }

    /// Running → Paused. The worker stops at its next chunk boundary.
    pub fn pause(&self) -> bool {
        let mut state = lock(&self.state);
        if state.removed || state.snapshot.status != TransferStatus::Running {
            return false;
        }
        if let Some(run) = &state.run {
            run.control.paused.store(true, Ordering::SeqCst);
        }
        state.snapshot.status = TransferStatus::Paused;
        state.snapshot.throughput = 0;
        debug!(id = self.id, bytes = state.snapshot.bytes_transferred, "transfer paused");
        self.publish(&state);
        true
    }

    /// Paused → Running with a fresh run from byte 0.
    pub fn resume(self: &Arc<Self>, ctx: &Arc<RunContext>) -> bool {
        let mut state = lock(&self.state);
        if state.removed || state.snapshot.status != TransferStatus::Paused {
            return false;
        }
        state.reset_counters();
        state.snapshot.status = TransferStatus::Running;
        debug!(id = self.id, "transfer resumed");
        self.publish(&state);
        self.launch(&mut state, ctx);
        true
    }

    /// Failed → Running with cleared error and counters.
    pub fn retry(self: &Arc<Self>, ctx: &Arc<RunContext>) -> bool {
        let mut state = lock(&self.state);
        if state.removed || state.snapshot.status != TransferStatus::Failed {
            return false;
        }
        state.reset_counters();
        state.snapshot.error = None;
        state.snapshot.status = TransferStatus::Running;
        debug!(id = self.id, "transfer retried");
        self.publish(&state);
        self.launch(&mut state, ctx);
        true
    }

    /// Pauses, resumes or retries depending on the current status.
    pub fn toggle(self: &Arc<Self>, ctx: &Arc<RunContext>) -> bool {
        let status = self.status();
        match status {
            TransferStatus::Running => self.pause(),
            TransferStatus::Paused => self.resume(ctx),
            TransferStatus::Failed => self.retry(ctx),
            TransferStatus::Queued | TransferStatus::Completed => false,
        }
    }

    /// Cancels the current run and detaches the task from its workers.
    ///
    /// Publishes [`TransferEvent::Removed`]; nothing is published for this
    /// task afterwards.
    pub fn retire(&self) {
        let mut state = lock(&self.state);
        if state.removed {
            return;
        }
        state.removed = true;
        state.generation += 1;
        if let Some(run) = &state.run {
            run.control.cancel.cancel();
        }
        let _ = self.events.send(TransferEvent::Removed { resource_id: self.id });
    }

    /// Cancels the current run, leaving the task registered.
    pub fn halt(&self) {
        let state = lock(&self.state);
        if let Some(run) = &state.run {
            run.control.cancel.cancel();
        }
    }

    fn launch(self: &Arc<Self>, state: &mut TaskState, ctx: &Arc<RunContext>) {
        state.generation += 1;
        let previous = state.run.take().map(|old| {
            old.control.cancel.cancel();
            old.handle
        });
        let control = RunControl::new(state.generation);
        state.meter.reset(Instant::now());

        let handle = tokio::spawn(worker::drive(
            Arc::clone(self),
            Arc::clone(ctx),
            control.clone(),
            previous,
        ));
        state.run = Some(ActiveRun { control, handle });
    }

    // -----------------------------------------------------------------------
    // Worker reports
    // -----------------------------------------------------------------------

    /// Marks the run as started once it holds a permit.
    ///
    /// Returns `false` when the run is stale or paused and must not proceed.
    pub fn begin(&self, run: &RunControl) -> bool {
        let mut state = lock(&self.state);
        if !state.is_current(run) || run.is_paused() {
            return false;
        }
        state.meter.reset(Instant::now());
        if state.snapshot.status == TransferStatus::Queued {
            state.snapshot.status = TransferStatus::Running;
            self.publish(&state);
        }
        true
    }

    pub fn set_local_path(&self, run: &RunControl, path: Option<PathBuf>) {
        let mut state = lock(&self.state);
        if state.is_current(run) {
            state.snapshot.local_path = path;
        }
    }

    pub fn set_total(&self, run: &RunControl, total: u64) {
        let mut state = lock(&self.state);
        if state.is_current(run) {
            state.snapshot.bytes_total = total;
        }
    }

    /// Records the cumulative byte count, publishing when the percentage
    /// moved or a new throughput sample was taken.
    pub fn record_progress(&self, run: &RunControl, transferred: u64, total: u64) {
        let mut guard = lock(&self.state);
        if !guard.is_current(run) || run.is_paused() {
            return;
        }
        let state = &mut *guard;
        if advance(&mut state.snapshot, &mut state.meter, transferred, total, Instant::now()) {
            self.publish(state);
        }
    }

    pub fn complete(&self, run: &RunControl, remote_file: Option<FileDescriptor>) {
        let mut state = lock(&self.state);
        if !state.is_current(run) || run.is_paused() {
            return;
        }
        let s = &mut state.snapshot;
        s.status = TransferStatus::Completed;
        s.progress = 100;
        s.throughput = 0;
        if s.bytes_total == 0 {
            s.bytes_total = s.bytes_transferred;
        }
        s.remote_file = remote_file;
        debug!(id = self.id, bytes = s.bytes_transferred, "transfer completed");
        self.publish(&state);
    }

    pub fn fail(&self, run: &RunControl, message: String) {
        let mut state = lock(&self.state);
        if !state.is_current(run) || run.is_paused() {
            return;
        }
        state.snapshot.status = TransferStatus::Failed;
        state.snapshot.throughput = 0;
        state.snapshot.error = Some(message);
        self.publish(&state);
    }
}

/// Applies a progress report to `snapshot`.
///
/// Returns whether the change is worth publishing.
fn advance(
    snapshot: &mut TransferSnapshot,
    meter: &mut ThroughputMeter,
    transferred: u64,
    total: u64,
    now: Instant,
) -> bool {
    if total > 0 {
        snapshot.bytes_total = total;
    }
    snapshot.bytes_transferred = transferred;

    let pct = percent(transferred, snapshot.bytes_total);
    let moved = pct != snapshot.progress;
    snapshot.progress = pct;

    let sampled = meter.record(transferred, now);
    if sampled {
        snapshot.throughput = meter.bytes_per_second();
    }
    moved || sampled
}
