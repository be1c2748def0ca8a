//! Worker runs: one async execution of a transfer task.

use std::path::Path;
use std::sync::Arc;

use clouddisk_api::{ByteStream, Download, EndpointError, FileDescriptor, ProgressFn, UploadRequest};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::destination::{Destination, DownloadTarget, resolve_destination};
use crate::task::{RunContext, RunControl, TransferTask};
use crate::types::TransferSource;
use crate::validation::validate_file_name;
use crate::{TransferError, UPLOAD_CHUNK_SIZE};

/// How a run ended when it did not fail.
enum RunOutcome {
    Completed(Option<FileDescriptor>),
    /// Paused or cancelled; nothing further is reported.
    Interrupted,
}

/// Drives one run of `task` to completion.
///
/// The previous run (if any) has already been cancelled and is awaited before
/// this run touches the network or the disk.
pub(crate) async fn drive(
    task: Arc<TransferTask>,
    ctx: Arc<RunContext>,
    run: RunControl,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    let _permit = tokio::select! {
        biased;
        _ = run.cancelled() => return,
        permit = Arc::clone(&ctx.permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    if !task.begin(&run) {
        return;
    }

    let id = task.id();
    let outcome = match task.source() {
        TransferSource::Download { target } => download(&task, &ctx, &run, target).await,
        TransferSource::Upload { path, folder_id } => upload(&task, &ctx, &run, path, *folder_id).await,
    };

    match outcome {
        Ok(RunOutcome::Completed(remote_file)) => task.complete(&run, remote_file),
        Ok(RunOutcome::Interrupted) => {
            debug!(id, paused = run.is_paused(), "run interrupted");
        }
        Err(e) => {
            warn!(id, error = %e, "transfer failed");
            task.fail(&run, e.to_string());
        }
    }
}

async fn download(
    task: &Arc<TransferTask>,
    ctx: &RunContext,
    run: &RunControl,
    target: &DownloadTarget,
) -> Result<RunOutcome, TransferError> {
    validate_file_name(task.name())?;
    let mut dest = resolve_destination(target, task.name()).await?;
    task.set_local_path(run, dest.local_path().map(Path::to_path_buf));

    let result = stream_into(task, ctx, run, &mut dest).await;
    match result {
        Ok(RunOutcome::Completed(remote)) => match dest.finish().await {
            Ok(()) => Ok(RunOutcome::Completed(remote)),
            Err(e) => {
                dest.discard().await;
                Err(EndpointError::DestinationUnwritable(e.to_string()).into())
            }
        },
        // A resumed run starts over, so partial files are never kept.
        other => {
            dest.discard().await;
            other
        }
    }
}

async fn stream_into(
    task: &TransferTask,
    ctx: &RunContext,
    run: &RunControl,
    dest: &mut Destination,
) -> Result<RunOutcome, TransferError> {
    let opened = tokio::select! {
        biased;
        _ = run.cancelled() => return Ok(RunOutcome::Interrupted),
        opened = ctx.endpoint.download(task.id()) => opened,
    };
    let Download { total_bytes, mut body } = opened?;
    let total = total_bytes.unwrap_or(0);
    if total > 0 {
        task.set_total(run, total);
    }

    let mut written: u64 = 0;
    loop {
        if run.is_paused() {
            return Ok(RunOutcome::Interrupted);
        }

        let next = tokio::select! {
            biased;
            _ = run.cancelled() => return Ok(RunOutcome::Interrupted),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;

        tokio::select! {
            biased;
            _ = run.cancelled() => return Ok(RunOutcome::Interrupted),
            res = dest.write_chunk(&chunk) => {
                res.map_err(|e| EndpointError::DestinationUnwritable(e.to_string()))?;
            }
        }

        written += chunk.len() as u64;
        task.record_progress(run, written, total);
    }

    Ok(RunOutcome::Completed(None))
}

async fn upload(
    task: &Arc<TransferTask>,
    ctx: &RunContext,
    run: &RunControl,
    path: &Path,
    folder_id: Option<i64>,
) -> Result<RunOutcome, TransferError> {
    let unreadable = |e: std::io::Error| EndpointError::SourceUnreadable(format!("{}: {e}", path.display()));

    let file = tokio::select! {
        biased;
        _ = run.cancelled() => return Ok(RunOutcome::Interrupted),
        file = tokio::fs::File::open(path) => file.map_err(unreadable)?,
    };
    let size = file.metadata().await.map_err(unreadable)?.len();
    task.set_total(run, size);

    let guard = run.clone();
    let content: ByteStream = Box::pin(ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE).map(
        move |chunk| {
            if guard.is_interrupted() {
                return Err(EndpointError::Network("upload interrupted".into()));
            }
            chunk.map_err(|e| EndpointError::SourceUnreadable(e.to_string()))
        },
    ));

    let reporter = Arc::clone(task);
    let reporter_run = run.clone();
    let on_progress: ProgressFn = Arc::new(move |sent, total| {
        reporter.record_progress(&reporter_run, sent, total);
    });

    let request = UploadRequest {
        name: task.name().to_string(),
        size_hint: size,
        folder_id,
        content,
    };

    let result = tokio::select! {
        biased;
        _ = run.cancelled() => return Ok(RunOutcome::Interrupted),
        result = ctx.endpoint.upload(request, on_progress) => result,
    };
    if run.is_interrupted() {
        return Ok(RunOutcome::Interrupted);
    }

    let remote = result?;
    debug!(id = task.id(), remote_id = remote.id, ?folder_id, "upload stored");
    Ok(RunOutcome::Completed(Some(remote)))
}
