use crate::engine::{DirectLink, MediaInfo, ProgressStage, ProgressUpdate};
use crate::relay::{ProgressRelay, TaskEventKind};
use crate::{now_ms, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FetchInfo,
    Download,
    FetchLinks,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::FetchInfo => "fetch_info",
            TaskKind::Download => "download",
            TaskKind::FetchLinks => "fetch_links",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Error)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Requested quality, e.g. `best`, `720p` or `audio-mp3`.
    pub format: String,
    pub destination: Option<PathBuf>,
    pub audio_only: bool,
    /// 1-based playlist positions; empty means all.
    pub playlist_items: Vec<u32>,
}

impl TaskOptions {
    pub fn with_format(format: &str) -> Self {
        Self {
            format: format.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent: f32,
    pub stage: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub item_index: Option<u32>,
    pub item_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutput {
    Info { info: MediaInfo },
    Files { paths: Vec<PathBuf> },
    Links { links: Vec<DirectLink> },
}

/// Point-in-time copy of a descriptor, safe to hand to the interactive side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: TaskKind,
    pub url: String,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub title: Option<String>,
    pub progress: TaskProgress,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub output: Option<TaskOutput>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

/// Set-once cancellation flag shared between the queue and the runner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// A descriptor the runner has moved to Running.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: String,
    pub kind: TaskKind,
    pub url: String,
    pub options: TaskOptions,
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Completed(TaskOutput),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A Pending task went straight to Cancelled.
    Cancelled,
    /// The runner was asked to stop a Running task.
    Requested,
    AlreadyFinished,
}

#[derive(Debug)]
struct TaskEntry {
    snapshot: TaskSnapshot,
    cancel: CancelToken,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: Vec<TaskEntry>,
    running: Option<String>,
    shutdown: bool,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut TaskEntry> {
        self.tasks.iter_mut().find(|t| t.snapshot.id == id)
    }

    fn has_claimable(&self) -> bool {
        self.running.is_none()
            && self
                .tasks
                .iter()
                .any(|t| t.snapshot.status == TaskStatus::Pending)
    }
}

/// The ordered task list shared by the interactive side and the runner.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    relay: ProgressRelay,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay(&self) -> &ProgressRelay {
        &self.relay
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: &TaskSnapshot) {
        self.relay.publish(
            &snapshot.id,
            TaskEventKind::Snapshot {
                snapshot: snapshot.clone(),
            },
        );
    }

    pub fn enqueue(&self, kind: TaskKind, url: &str, options: TaskOptions) -> Result<TaskSnapshot> {
        // Malformed URLs are reported by the engine on the task itself.
        let url = url.trim().to_string();
        validate_options(kind, &options)?;

        let snapshot = TaskSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            url,
            options,
            status: TaskStatus::Pending,
            title: None,
            progress: TaskProgress::default(),
            error: None,
            cancel_requested: false,
            output: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
        };

        let mut state = self.lock();
        if state.shutdown {
            return Err(EngineError::InvalidOptions(
                "the task runner is shutting down".to_string(),
            ));
        }
        state.tasks.push(TaskEntry {
            snapshot: snapshot.clone(),
            cancel: CancelToken::new(),
        });
        self.publish(&snapshot);
        drop(state);

        self.work_ready.notify_all();
        Ok(snapshot)
    }

    /// Claims the earliest Pending task, but only while nothing is Running.
    pub fn next_pending(&self) -> Option<ClaimedTask> {
        let mut state = self.lock();
        if state.shutdown || state.running.is_some() {
            return None;
        }
        let entry = state
            .tasks
            .iter_mut()
            .find(|t| t.snapshot.status == TaskStatus::Pending)?;

        entry.snapshot.status = TaskStatus::Running;
        entry.snapshot.started_at_ms = Some(now_ms());
        let claimed = ClaimedTask {
            id: entry.snapshot.id.clone(),
            kind: entry.snapshot.kind,
            url: entry.snapshot.url.clone(),
            options: entry.snapshot.options.clone(),
            cancel: entry.cancel.clone(),
        };
        let snapshot = entry.snapshot.clone();
        state.running = Some(claimed.id.clone());
        self.publish(&snapshot);
        Some(claimed)
    }

    /// Blocks until a task can be claimed, the timeout passes, or shutdown.
    /// Returns false once the queue is shut down.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let state = self.lock();
        if state.shutdown {
            return false;
        }
        if state.has_claimable() {
            return true;
        }
        let (state, _) = self
            .work_ready
            .wait_timeout_while(state, timeout, |s| !s.shutdown && !s.has_claimable())
            .unwrap_or_else(PoisonError::into_inner);
        !state.shutdown
    }

    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let mut state = self.lock();
        let entry = state
            .find_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        let outcome = match entry.snapshot.status {
            TaskStatus::Pending => {
                entry.cancel.cancel();
                entry.snapshot.status = TaskStatus::Cancelled;
                entry.snapshot.cancel_requested = true;
                entry.snapshot.finished_at_ms = Some(now_ms());
                CancelOutcome::Cancelled
            }
            TaskStatus::Running => {
                if entry.snapshot.cancel_requested {
                    return Ok(CancelOutcome::Requested);
                }
                entry.cancel.cancel();
                entry.snapshot.cancel_requested = true;
                CancelOutcome::Requested
            }
            _ => return Ok(CancelOutcome::AlreadyFinished),
        };
        let snapshot = entry.snapshot.clone();
        self.publish(&snapshot);
        Ok(outcome)
    }

    /// Cancels every task that has not finished yet. Returns how many were touched.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .lock()
            .tasks
            .iter()
            .filter(|t| !t.snapshot.status.is_terminal())
            .map(|t| t.snapshot.id.clone())
            .collect();
        ids.iter()
            .filter(|id| {
                matches!(
                    self.cancel(id),
                    Ok(CancelOutcome::Cancelled | CancelOutcome::Requested)
                )
            })
            .count()
    }

    /// Drops finished tasks from the list. History is not touched.
    pub fn remove_finished(&self) -> usize {
        let mut state = self.lock();
        let mut removed = Vec::new();
        state.tasks.retain(|t| {
            if t.snapshot.status.is_terminal() {
                removed.push(t.snapshot.id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.relay.publish(id, TaskEventKind::Removed);
        }
        removed.len()
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.lock().tasks.iter().map(|t| t.snapshot.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        self.lock()
            .tasks
            .iter()
            .find(|t| t.snapshot.id == id)
            .map(|t| t.snapshot.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .tasks
            .iter()
            .filter(|t| t.snapshot.status == TaskStatus::Pending)
            .count()
    }

    pub fn running_id(&self) -> Option<String> {
        self.lock().running.clone()
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.work_ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Applies a progress report. Percent never moves backwards.
    pub fn update_progress(&self, id: &str, overall_percent: Option<f32>, update: &ProgressUpdate) {
        let mut state = self.lock();
        let Some(entry) = state.find_mut(id) else {
            return;
        };
        if entry.snapshot.status != TaskStatus::Running {
            return;
        }

        let progress = &mut entry.snapshot.progress;
        if let Some(pct) = overall_percent.filter(|p| p.is_finite()) {
            progress.percent = progress.percent.max(pct.clamp(0.0, 100.0));
        }
        progress.stage = Some(update.stage.label().to_string());
        if update.stage == ProgressStage::Downloading {
            progress.speed = update.speed.clone();
            progress.eta = update.eta.clone();
        } else {
            progress.speed = None;
            progress.eta = None;
        }
        if update.item_index.is_some() {
            progress.item_index = update.item_index;
        }
        if update.item_count.is_some() {
            progress.item_count = update.item_count;
        }
        if entry.snapshot.title.is_none() {
            entry.snapshot.title = update.title.clone().filter(|t| !t.trim().is_empty());
        }

        let snapshot = entry.snapshot.clone();
        self.publish(&snapshot);
    }

    pub fn set_title(&self, id: &str, title: Option<String>) {
        let mut state = self.lock();
        let Some(entry) = state.find_mut(id) else {
            return;
        };
        if entry.snapshot.status.is_terminal() || title == entry.snapshot.title {
            return;
        }
        entry.snapshot.title = title;
        let snapshot = entry.snapshot.clone();
        self.publish(&snapshot);
    }

    /// Moves a Running task to its terminal state. A set cancel flag always
    /// wins over a successful result.
    pub fn finish(&self, id: &str, result: TaskResult) -> Option<TaskSnapshot> {
        let mut state = self.lock();
        if state.running.as_deref() == Some(id) {
            state.running = None;
        }
        let entry = state.find_mut(id)?;
        if entry.snapshot.status != TaskStatus::Running {
            return Some(entry.snapshot.clone());
        }

        let result = if entry.cancel.is_cancelled() {
            TaskResult::Cancelled
        } else {
            result
        };
        let next = match &result {
            TaskResult::Completed(_) => TaskStatus::Completed,
            TaskResult::Failed(_) => TaskStatus::Error,
            TaskResult::Cancelled => TaskStatus::Cancelled,
        };
        debug_assert!(entry.snapshot.status.can_transition_to(next));

        entry.snapshot.status = next;
        entry.snapshot.finished_at_ms = Some(now_ms());
        entry.snapshot.progress.speed = None;
        entry.snapshot.progress.eta = None;
        match result {
            TaskResult::Completed(output) => {
                entry.snapshot.progress.percent = 100.0;
                entry.snapshot.progress.stage = None;
                entry.snapshot.output = Some(output);
            }
            TaskResult::Failed(message) => {
                entry.snapshot.error = Some(message);
            }
            TaskResult::Cancelled => {}
        }

        let snapshot = entry.snapshot.clone();
        self.publish(&snapshot);
        drop(state);

        self.work_ready.notify_all();
        Some(snapshot)
    }

    pub fn report_history_failure(&self, id: &str, message: &str) {
        let _state = self.lock();
        self.relay.publish(
            id,
            TaskEventKind::HistoryWriteFailed {
                message: message.to_string(),
            },
        );
    }
}

fn validate_options(kind: TaskKind, options: &TaskOptions) -> Result<()> {
    if kind == TaskKind::Download && options.destination.is_none() {
        return Err(EngineError::InvalidOptions(
            "a download needs a destination folder".to_string(),
        ));
    }
    if options.playlist_items.iter().any(|i| *i == 0) {
        return Err(EngineError::InvalidOptions(
            "playlist item positions start at 1".to_string(),
        ));
    }
    Ok(())
}
