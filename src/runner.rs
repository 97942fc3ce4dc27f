//! Task Runner (component D): drives a single task from its current state through to a
//! terminal one. Spawned by the scheduler's `pump()`, one per active task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::decrypt;
use crate::error::TaskError;
use crate::fetcher::{self, FetchOptions, TOTAL_UNKNOWN};
use crate::hls;
use crate::model::{Task, TaskKind, TaskStatus};
use crate::scheduler::Scheduler;

const HLS_MAX_REDIRECTS: u32 = 2;
const SEGMENT_MAX_RETRIES: u32 = 3;
const SEGMENT_RETRY_DELAY: Duration = Duration::from_secs(2);
const PROGRESS_EPSILON: f32 = 0.005;

/// Run `id` to completion, pause, or failure, then release its scheduler slot.
pub async fn run(scheduler: Arc<Scheduler>, id: String, token: CancellationToken) {
    let Some(task) = scheduler.get(&id).await else {
        scheduler.on_run_finished().await;
        return;
    };

    let result = match task.kind {
        TaskKind::Mp4 => run_mp4(&scheduler, &task, &token).await,
        TaskKind::Hls => run_hls(&scheduler, &task, &token).await,
    };

    match result {
        Ok(()) => {
            scheduler
                .apply(&id, |t| {
                    t.status = TaskStatus::Completed;
                    t.progress = 1.0;
                    t.cancel_handle = None;
                })
                .await;
        }
        Err(RunOutcome::Cancelled) => {
            // Status was already set to Paused/Cancelled by the scheduler op that
            // triggered cancellation; just drop the handle.
            scheduler
                .apply(&id, |t| {
                    t.cancel_handle = None;
                })
                .await;
        }
        Err(RunOutcome::Failed(err)) => {
            let message = err.to_string();
            tracing::warn!(task_id = %id, error = %message, "task failed");
            scheduler
                .apply(&id, |t| {
                    t.status = TaskStatus::Failed;
                    t.error = Some(message);
                    t.cancel_handle = None;
                })
                .await;
        }
    }

    scheduler.on_run_finished().await;
}

enum RunOutcome {
    Cancelled,
    Failed(TaskError),
}

impl From<TaskError> for RunOutcome {
    fn from(err: TaskError) -> Self {
        if matches!(err, TaskError::Cancelled) {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Failed(err)
        }
    }
}

fn dest_path(scheduler: &Scheduler, id: &str) -> PathBuf {
    scheduler.download_dir().join(format!("{id}.mp4"))
}

fn temp_dir(scheduler: &Scheduler, id: &str) -> PathBuf {
    scheduler.download_dir().join(format!("{id}_temp"))
}

fn mp4_progress_fraction(received: u64, total: u64) -> f32 {
    if total == TOTAL_UNKNOWN || total == 0 {
        0.0
    } else {
        (received as f32 / total as f32).clamp(0.0, 1.0)
    }
}

async fn apply_mp4_progress(scheduler: &Scheduler, id: &str, received: u64, total: u64) {
    let progress = mp4_progress_fraction(received, total);
    let total_units = if total == TOTAL_UNKNOWN { 0 } else { total as i64 };
    scheduler
        .apply(id, |t| {
            t.progress = progress;
            t.downloaded_units = received as i64;
            t.total_units = total_units;
        })
        .await;
}

async fn run_mp4(scheduler: &Arc<Scheduler>, task: &Task, token: &CancellationToken) -> Result<(), RunOutcome> {
    tokio::fs::create_dir_all(scheduler.download_dir())
        .await
        .map_err(|e| RunOutcome::Failed(TaskError::FilesystemError(e.to_string())))?;

    let dest = dest_path(scheduler, &task.id);
    let range_from = tokio::fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);

    let url = Url::parse(&task.url).map_err(|e| RunOutcome::Failed(TaskError::FilesystemError(e.to_string())))?;
    let client = scheduler.client();

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<(u64, u64)>();
    let mut last_emitted = -1.0f32;
    let mut on_progress = move |received: u64, total: u64| {
        let progress = mp4_progress_fraction(received, total);
        if (progress - last_emitted).abs() >= PROGRESS_EPSILON || progress >= 1.0 {
            last_emitted = progress;
            let _ = progress_tx.send((received, total));
        }
    };

    let fetch = fetcher::fetch(
        &client,
        &url,
        &dest,
        FetchOptions {
            token,
            range_from,
            on_progress: &mut on_progress,
        },
    );
    tokio::pin!(fetch);

    // Drain progress updates between polls of `fetch` so every emission is applied in
    // the order it was produced, on the same task that later sets the terminal status.
    let fetch_result = loop {
        tokio::select! {
            biased;
            Some((received, total)) = progress_rx.recv() => {
                apply_mp4_progress(scheduler, &task.id, received, total).await;
            }
            result = &mut fetch => break result,
        }
    };
    fetch_result.map_err(TaskError::from)?;
    while let Ok((received, total)) = progress_rx.try_recv() {
        apply_mp4_progress(scheduler, &task.id, received, total).await;
    }

    scheduler
        .apply(&task.id, |t| {
            t.save_path = Some(dest.to_string_lossy().into_owned());
        })
        .await;

    Ok(())
}

async fn run_hls(scheduler: &Arc<Scheduler>, task: &Task, token: &CancellationToken) -> Result<(), RunOutcome> {
    let client = scheduler.client();
    let manifest_url =
        Url::parse(&task.url).map_err(|e| RunOutcome::Failed(TaskError::FilesystemError(e.to_string())))?;

    let (_, segments) = hls::resolve_to_segments(&client, &manifest_url, token, HLS_MAX_REDIRECTS)
        .await
        .map_err(TaskError::from)?;

    let work_dir = temp_dir(scheduler, &task.id);
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(|e| RunOutcome::Failed(TaskError::FilesystemError(e.to_string())))?;

    scheduler
        .apply(&task.id, |t| {
            t.total_units = segments.len() as i64;
        })
        .await;

    let start_index = task.downloaded_units.max(0) as usize;
    let mut last_emitted = -1.0f32;

    for (index, segment_url) in segments.iter().enumerate().skip(start_index) {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled.into());
        }
        fetch_segment_with_retry(&client, segment_url, &work_dir, index, token).await?;

        if let Some(key) = &task.key {
            let segment_path = segment_path(&work_dir, index);
            decrypt::decrypt_file_in_place(segment_path, key.clone(), task.iv.clone(), index)
                .await
                .map_err(TaskError::from)?;
        }

        let total = segments.len();
        let progress = ((index + 1) as f32 / total as f32).clamp(0.0, 1.0);
        if (progress - last_emitted).abs() >= PROGRESS_EPSILON || progress >= 1.0 {
            last_emitted = progress;
            scheduler
                .apply(&task.id, |t| {
                    t.progress = progress;
                    t.downloaded_units = (index + 1) as i64;
                })
                .await;
        }
    }

    let dest = dest_path(scheduler, &task.id);
    concatenate_segments(&work_dir, segments.len(), &dest)
        .await
        .map_err(|e| RunOutcome::Failed(TaskError::FilesystemError(e.to_string())))?;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;

    scheduler
        .apply(&task.id, |t| {
            t.save_path = Some(dest.to_string_lossy().into_owned());
        })
        .await;

    Ok(())
}

fn segment_path(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("segment_{index}.ts"))
}

async fn fetch_segment_with_retry(
    client: &reqwest::Client,
    url: &Url,
    work_dir: &Path,
    index: usize,
    token: &CancellationToken,
) -> Result<(), RunOutcome> {
    let dest = segment_path(work_dir, index);
    let mut attempt = 0;
    loop {
        let mut no_op = |_: u64, _: u64| {};
        let result = fetcher::fetch(
            client,
            url,
            &dest,
            FetchOptions {
                token,
                range_from: 0,
                on_progress: &mut no_op,
            },
        )
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(err) if err.is_cancelled() => return Err(TaskError::Cancelled.into()),
            Err(crate::error::FetchError::HttpStatus(404)) => {
                return Err(TaskError::SegmentFailed { index }.into());
            }
            Err(err) => {
                attempt += 1;
                if attempt > SEGMENT_MAX_RETRIES {
                    tracing::warn!(index, error = %err, "segment failed after max retries");
                    return Err(TaskError::SegmentFailed { index }.into());
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(TaskError::Cancelled.into()),
                    _ = tokio::time::sleep(SEGMENT_RETRY_DELAY) => {}
                }
            }
        }
    }
}

async fn concatenate_segments(work_dir: &Path, count: usize, dest: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;
    for index in 0..count {
        let bytes = tokio::fs::read(segment_path(work_dir, index)).await?;
        out.write_all(&bytes).await?;
    }
    out.flush().await?;
    Ok(())
}
