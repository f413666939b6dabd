use crate::config::EngineConfig;
use crate::engine::{DownloadRequest, Engine, LinksRequest, ProgressStage, ProgressUpdate};
use crate::format::{FormatPlan, AUDIO_MP3_CHOICE};
use crate::history::{HistoryOperation, HistoryStore, NewHistoryEntry};
use crate::paths::AppPaths;
use crate::task::{
    ClaimedTask, TaskKind, TaskOptions, TaskOutput, TaskQueue, TaskResult, TaskSnapshot,
    TaskStatus,
};
use crate::task_log::{self, TaskLog, TaskLogRetention};
use crate::{EngineError, Result};
use serde_json::json;
use std::ffi::OsStr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Everything the runner thread needs.
pub struct RunnerContext {
    pub paths: AppPaths,
    pub config: EngineConfig,
    pub queue: Arc<TaskQueue>,
    pub engine: Arc<dyn Engine>,
    pub history: HistoryStore,
    pub ffmpeg_available: bool,
}

#[derive(Debug)]
pub struct RunnerHandle {
    queue: Arc<TaskQueue>,
    thread: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Stops claiming new tasks and wakes the runner if it is idle.
    pub fn stop(&self) {
        self.queue.shutdown();
    }

    /// Waits for the runner thread, which exits after its current task.
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("task runner thread panicked");
            }
        }
    }
}

pub fn start_runner(ctx: RunnerContext) -> Result<RunnerHandle> {
    ctx.paths.ensure_dirs()?;

    // Workspaces left over from a crash are never resumed.
    let removed = remove_stale_workspaces(&ctx.paths);
    if removed > 0 {
        log::info!("removed {removed} leftover task workspace(s)");
    }

    let prune_paths = ctx.paths.clone();
    thread::spawn(move || {
        if let Err(err) = task_log::prune(&prune_paths, TaskLogRetention::default()) {
            log::debug!("task log prune failed: {err}");
        }
    });

    let queue = ctx.queue.clone();
    let handle = thread::Builder::new()
        .name("spiderfetch-runner".to_string())
        .spawn(move || runner_loop(ctx))?;

    Ok(RunnerHandle {
        queue,
        thread: Some(handle),
    })
}

fn runner_loop(ctx: RunnerContext) {
    log::info!("task runner started");
    loop {
        match ctx.queue.next_pending() {
            Some(task) => run_task(&ctx, task),
            None => {
                if !ctx.queue.wait_for_work(IDLE_WAIT) {
                    break;
                }
            }
        }
    }
    log::info!("task runner stopped");
}

fn run_task(ctx: &RunnerContext, task: ClaimedTask) {
    log::info!("task {} started: {} {}", task.id, task.kind.as_str(), task.url);
    let journal = TaskLog::new(&ctx.paths, &task.id, task.kind);
    journal.info("task_started", json!({ "url": task.url, "options": task.options }));

    let result = if task.cancel.is_cancelled() {
        TaskResult::Cancelled
    } else {
        match catch_unwind(AssertUnwindSafe(|| dispatch(ctx, &task, &journal))) {
            Ok(Ok(output)) => TaskResult::Completed(output),
            Ok(Err(err)) if err.is_cancelled() => TaskResult::Cancelled,
            Ok(Err(err)) => TaskResult::Failed(err.user_message()),
            Err(_) => {
                log::error!("task {} panicked inside the engine call", task.id);
                TaskResult::Failed("internal error while running the task".to_string())
            }
        }
    };

    let Some(snapshot) = settle(ctx, &task, &journal, result) else {
        return;
    };

    let outcome = json!({ "status": snapshot.status.as_str(), "error": snapshot.error });
    match &snapshot.error {
        Some(err) => {
            journal.error("task_finished", outcome);
            log::warn!("task {} failed: {err}", task.id);
        }
        None => {
            journal.info("task_finished", outcome);
            log::info!("task {} {}", task.id, snapshot.status.as_str());
        }
    }

    if snapshot.status == TaskStatus::Completed {
        record_history(ctx, &task, &journal, &snapshot);
    }
}

/// Hands the result to the queue. A cancel that arrived after files were
/// delivered still ends the task Cancelled, so those files are taken back.
fn settle(
    ctx: &RunnerContext,
    task: &ClaimedTask,
    journal: &TaskLog,
    result: TaskResult,
) -> Option<TaskSnapshot> {
    let delivered = match &result {
        TaskResult::Completed(TaskOutput::Files { paths }) => paths.clone(),
        _ => Vec::new(),
    };
    let snapshot = ctx.queue.finish(&task.id, result)?;
    if snapshot.status == TaskStatus::Cancelled && !delivered.is_empty() {
        discard_delivered(journal, &delivered);
    }
    Some(snapshot)
}

fn discard_delivered(journal: &TaskLog, files: &[PathBuf]) {
    for file in files {
        if let Err(err) = std::fs::remove_file(file) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove canceled download {}: {err}", file.display());
            }
        }
    }
    journal.warn("delivery_discarded", json!({ "files": files }));
}

fn dispatch(ctx: &RunnerContext, task: &ClaimedTask, journal: &TaskLog) -> Result<TaskOutput> {
    match task.kind {
        TaskKind::FetchInfo => {
            let info = ctx.engine.fetch_info(&task.url, &task.cancel)?;
            ctx.queue.set_title(&task.id, info.title.clone());
            Ok(TaskOutput::Info { info })
        }
        TaskKind::Download => run_download(ctx, task, journal),
        TaskKind::FetchLinks => {
            let plan = plan_for(ctx, task, journal);
            let request = LinksRequest {
                url: task.url.clone(),
                selector: plan.selector,
                playlist_items: task.options.playlist_items.clone(),
            };
            let links = ctx.engine.fetch_direct_links(&request, &task.cancel)?;
            if let Some(title) = links.iter().find_map(|l| l.title.clone()) {
                ctx.queue.set_title(&task.id, Some(title));
            }
            Ok(TaskOutput::Links { links })
        }
    }
}

fn plan_for(ctx: &RunnerContext, task: &ClaimedTask, journal: &TaskLog) -> FormatPlan {
    let plan = FormatPlan::from_choice(
        &task.options.format,
        task.options.audio_only,
        ctx.ffmpeg_available,
    );
    if let Some(warning) = &plan.warning {
        log::warn!("task {}: {warning}", task.id);
        journal.warn("format_warning", json!({ "warning": warning }));
    }
    plan
}

fn run_download(ctx: &RunnerContext, task: &ClaimedTask, journal: &TaskLog) -> Result<TaskOutput> {
    let destination = task
        .options
        .destination
        .clone()
        .ok_or_else(|| {
            EngineError::InvalidOptions("a download needs a destination folder".to_string())
        })?;
    std::fs::create_dir_all(&destination).map_err(|e| {
        EngineError::Download(format!(
            "cannot create destination folder {}: {e}",
            destination.display()
        ))
    })?;

    let plan = plan_for(ctx, task, journal);
    let workspace = Workspace::create(ctx.paths.task_work_dir(&task.id))?;
    let request = DownloadRequest {
        url: task.url.clone(),
        plan,
        work_dir: workspace.path().to_path_buf(),
        playlist_items: task.options.playlist_items.clone(),
    };

    let queue = &ctx.queue;
    let selected = &task.options.playlist_items;
    let mut on_progress = |update: ProgressUpdate| {
        let overall = overall_percent(&update, selected);
        if catch_unwind(AssertUnwindSafe(|| queue.update_progress(&task.id, overall, &update)))
            .is_err()
        {
            log::error!("progress relay panicked for task {}", task.id);
        }
    };
    let artifacts = ctx
        .engine
        .download(&request, &mut on_progress, &task.cancel)?;
    task.cancel.check()?;

    let artifacts: Vec<PathBuf> = artifacts
        .into_iter()
        .filter(|a| a.starts_with(workspace.path()) && a.is_file())
        .collect();
    if artifacts.is_empty() {
        return Err(EngineError::Download(
            "the download produced no file in its workspace".to_string(),
        ));
    }

    on_progress(ProgressUpdate::stage(ProgressStage::MovingFiles));
    let mut delivered = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        if task.cancel.is_cancelled() {
            if !delivered.is_empty() {
                discard_delivered(journal, &delivered);
            }
            return Err(EngineError::Cancelled);
        }
        let target = deliver(artifact, &destination).map_err(|e| {
            EngineError::Download(format!(
                "could not move {} into {}: {e}",
                artifact.display(),
                destination.display()
            ))
        })?;
        delivered.push(target);
    }
    journal.info("files_delivered", json!({ "files": delivered }));
    Ok(TaskOutput::Files { paths: delivered })
}

/// Percent across the whole request, folding playlist position into the
/// current item's percent.
fn overall_percent(update: &ProgressUpdate, selected: &[u32]) -> Option<f32> {
    let item_pct = update.percent?;
    let (position, count) = if selected.is_empty() {
        (update.item_index, update.item_count.unwrap_or(1))
    } else {
        let position = update
            .item_index
            .and_then(|i| selected.iter().position(|s| *s == i))
            .map(|p| (p + 1) as u32);
        (position, selected.len() as u32)
    };
    match position {
        Some(pos) if count > 1 && pos >= 1 && pos <= count => {
            Some(((pos - 1) as f32 + item_pct / 100.0) / count as f32 * 100.0)
        }
        _ if count > 1 => None,
        _ => Some(item_pct),
    }
}

fn record_history(
    ctx: &RunnerContext,
    task: &ClaimedTask,
    journal: &TaskLog,
    snapshot: &TaskSnapshot,
) {
    let operation = match task.kind {
        TaskKind::Download => HistoryOperation::Download,
        TaskKind::FetchInfo => HistoryOperation::FetchInfo,
        TaskKind::FetchLinks => HistoryOperation::FetchLinks,
    };
    if operation != HistoryOperation::Download && !ctx.config.record_lookups_in_history {
        return;
    }

    let dest_path = match &snapshot.output {
        Some(TaskOutput::Files { paths }) if paths.len() == 1 => Some(paths[0].clone()),
        Some(TaskOutput::Files { .. }) => task.options.destination.clone(),
        _ => None,
    };
    let title = snapshot.title.clone().or_else(|| match &snapshot.output {
        Some(TaskOutput::Info { info }) => info.title.clone(),
        _ => None,
    });
    let format = match task.kind {
        TaskKind::FetchInfo => None,
        _ => Some(format_label(&task.options)),
    };

    let entry = NewHistoryEntry {
        url: task.url.clone(),
        title,
        format,
        dest_path: dest_path.map(|p| p.to_string_lossy().to_string()),
        operation,
    };
    if let Err(err) = ctx.history.insert(entry) {
        log::error!("history write failed for task {}: {err}", task.id);
        journal.error("history_write_failed", json!({ "error": err.to_string() }));
        ctx.queue.report_history_failure(&task.id, &err.to_string());
    }
}

fn format_label(options: &TaskOptions) -> String {
    if options.audio_only {
        return AUDIO_MP3_CHOICE.to_string();
    }
    let trimmed = options.format.trim();
    if trimmed.is_empty() {
        "best".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Private per-task directory, removed when dropped.
struct Workspace {
    path: PathBuf,
}

impl Workspace {
    fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove workspace {}: {err}", self.path.display());
            }
        }
    }
}

fn remove_stale_workspaces(paths: &AppPaths) -> usize {
    let Ok(entries) = std::fs::read_dir(paths.work_dir()) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| std::fs::remove_dir_all(e.path()).is_ok())
        .count()
}

/// Moves a finished file into `dest_dir` without overwriting anything there.
/// Falls back to copy and remove when a rename crosses volumes; the copy is
/// staged under a hidden name so no partial file ever carries the final name.
fn deliver(artifact: &Path, dest_dir: &Path) -> std::io::Result<PathBuf> {
    let name = artifact.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact has no file name")
    })?;
    let target = unique_destination(dest_dir, name);
    if std::fs::rename(artifact, &target).is_ok() {
        return Ok(target);
    }

    let staging = dest_dir.join(format!(".{}.part", uuid::Uuid::new_v4()));
    let copied = std::fs::copy(artifact, &staging).and_then(|_| std::fs::rename(&staging, &target));
    if let Err(err) = copied {
        let _ = std::fs::remove_file(&staging);
        return Err(err);
    }
    let _ = std::fs::remove_file(artifact);
    Ok(target)
}

fn unique_destination(dir: &Path, name: &OsStr) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = as_path.extension().map(|e| e.to_string_lossy().to_string());
    for n in 1..10_000u32 {
        let file = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !candidate.exists() {
            return candidate;
        }
    }
    let suffix = ext.map(|e| format!(".{e}")).unwrap_or_default();
    dir.join(format!("{stem} ({}){suffix}", uuid::Uuid::new_v4()))
}
