use crate::config::{self, EngineConfig};
use crate::engine::Engine;
use crate::ffmpeg;
use crate::history::{HistoryCursor, HistoryEntry, HistoryStore};
use crate::paths::AppPaths;
use crate::relay::TaskEvent;
use crate::runner::{self, RunnerContext, RunnerHandle};
use crate::task::{CancelOutcome, TaskKind, TaskOptions, TaskQueue, TaskSnapshot};
use crate::ytdlp::YtDlpEngine;
use crate::Result;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// The surface a UI shell talks to: queue operations, history, and the
/// event stream. Dropping the service cancels outstanding work and stops
/// the runner.
pub struct DownloadService {
    paths: AppPaths,
    config: EngineConfig,
    queue: Arc<TaskQueue>,
    history: HistoryStore,
    runner: Option<RunnerHandle>,
}

impl DownloadService {
    /// Loads `engine.json`, locates ffmpeg and starts a yt-dlp backed runner.
    pub fn start_default(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let config = config::load_engine_config(&paths)?;
        let ffmpeg = ffmpeg::locate(&paths, &config);
        let engine = YtDlpEngine::new(paths.clone(), config.clone(), ffmpeg.clone());
        Self::start(paths, config, Arc::new(engine), ffmpeg.is_some())
    }

    pub fn start(
        paths: AppPaths,
        config: EngineConfig,
        engine: Arc<dyn Engine>,
        ffmpeg_available: bool,
    ) -> Result<Self> {
        let history = HistoryStore::open(paths.clone())?;
        let queue = Arc::new(TaskQueue::new());
        let runner = runner::start_runner(RunnerContext {
            paths: paths.clone(),
            config: config.clone(),
            queue: queue.clone(),
            engine,
            history: history.clone(),
            ffmpeg_available,
        })?;
        Ok(Self {
            paths,
            config,
            queue,
            history,
            runner: Some(runner),
        })
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts receiving task events; replaces any earlier subscriber.
    pub fn subscribe(&self) -> Receiver<TaskEvent> {
        self.queue
            .relay()
            .subscribe(self.config.event_channel_capacity)
    }

    /// Enqueues a task. Downloads without a destination go to the default
    /// download folder.
    pub fn enqueue(
        &self,
        kind: TaskKind,
        url: &str,
        mut options: TaskOptions,
    ) -> Result<TaskSnapshot> {
        if kind == TaskKind::Download && options.destination.is_none() {
            options.destination = Some(self.config.download_dir(&self.paths));
        }
        self.queue.enqueue(kind, url, options)
    }

    pub fn fetch_info(&self, url: &str) -> Result<TaskSnapshot> {
        self.enqueue(TaskKind::FetchInfo, url, TaskOptions::default())
    }

    pub fn download(&self, url: &str, options: TaskOptions) -> Result<TaskSnapshot> {
        self.enqueue(TaskKind::Download, url, options)
    }

    pub fn fetch_links(&self, url: &str, options: TaskOptions) -> Result<TaskSnapshot> {
        self.enqueue(TaskKind::FetchLinks, url, options)
    }

    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        self.queue.cancel(task_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    pub fn remove_finished(&self) -> usize {
        self.queue.remove_finished()
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.queue.list()
    }

    pub fn task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.queue.get(task_id)
    }

    pub fn list_history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        self.history.list(limit, offset)
    }

    pub fn history_entries(&self) -> HistoryCursor {
        self.history.list_all()
    }

    pub fn delete_history(&self, id: i64) -> Result<bool> {
        self.history.delete(id)
    }

    pub fn clear_history(&self) -> Result<usize> {
        self.history.clear_all()
    }

    /// Cancels pending and running work and waits for the runner to exit.
    pub fn shutdown(mut self) {
        self.stop_runner();
    }

    fn stop_runner(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        self.queue.cancel_all();
        runner.stop();
        runner.join();
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        self.stop_runner();
    }
}
