use crate::paths::AppPaths;
use crate::task::TaskKind;
use crate::{now_ms, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const LOG_EXT: &str = ".jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLogRetention {
    /// A task's current log is rotated once it reaches this size.
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for TaskLogRetention {
    fn default() -> Self {
        Self {
            rotate_bytes: 4 * 1024 * 1024,
            max_backups: 2,
            max_age_days: 30,
            total_cap_bytes: 128 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Event log of a single task, one JSON object per line under
/// `logs/tasks/<task_id>.jsonl`.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: PathBuf,
    task_id: String,
    kind: TaskKind,
    retention: TaskLogRetention,
}

impl TaskLog {
    pub fn new(paths: &AppPaths, task_id: &str, kind: TaskKind) -> Self {
        Self {
            path: paths.task_log_path(task_id),
            task_id: task_id.to_string(),
            kind,
            retention: TaskLogRetention::default(),
        }
    }

    pub fn with_retention(mut self, retention: TaskLogRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, level: LogLevel, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "task_id": self.task_id,
            "kind": self.kind.as_str(),
            "level": level.as_str(),
            "event": event,
            "data": data
        });

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if self.is_full() {
            self.rotate()?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn info(&self, event: &str, data: serde_json::Value) {
        self.record(LogLevel::Info, event, data);
    }

    pub fn warn(&self, event: &str, data: serde_json::Value) {
        self.record(LogLevel::Warn, event, data);
    }

    pub fn error(&self, event: &str, data: serde_json::Value) {
        self.record(LogLevel::Error, event, data);
    }

    /// A task never fails because its log could not be written.
    pub fn record(&self, level: LogLevel, event: &str, data: serde_json::Value) {
        if let Err(err) = self.write(level, event, data) {
            log::debug!("task log write failed for {}: {err}", self.task_id);
        }
    }

    fn is_full(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.len() >= self.retention.rotate_bytes)
            .unwrap_or(false)
    }

    /// `<id>.jsonl` becomes `<id>.jsonl.1`; older backups move up and the
    /// oldest beyond `max_backups` is dropped.
    fn rotate(&self) -> std::io::Result<()> {
        let max = self.retention.max_backups;
        if max == 0 {
            return remove_if_present(&self.path);
        }
        remove_if_present(&self.backup(max))?;
        for n in (1..max).rev() {
            let from = self.backup(n);
            if from.exists() {
                std::fs::rename(&from, self.backup(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup(1))
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// All files one task left behind: the current log plus its backups.
#[derive(Debug, Default)]
struct TaskLogSet {
    files: Vec<PathBuf>,
    bytes: u64,
    last_write: Option<SystemTime>,
}

fn owning_task(file_name: &str) -> Option<&str> {
    let idx = file_name.find(LOG_EXT)?;
    let rest = &file_name[idx + LOG_EXT.len()..];
    let is_backup = rest
        .strip_prefix('.')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
    (rest.is_empty() || is_backup).then_some(&file_name[..idx])
}

/// Removes the logs of tasks that have not written anything within the age
/// limit, then the least recently active tasks until the directory fits the
/// byte cap. A task's backups always go with it. Returns the number of
/// files removed.
pub fn prune(paths: &AppPaths, retention: TaskLogRetention) -> Result<usize> {
    let dir = paths.task_logs_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut sets: HashMap<String, TaskLogSet> = HashMap::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(task_id) = owning_task(&name) else {
            continue;
        };
        let set = sets.entry(task_id.to_string()).or_default();
        set.files.push(entry.path());
        set.bytes += meta.len();
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        set.last_write = Some(set.last_write.map_or(modified, |t| t.max(modified)));
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.max_age_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut sets: Vec<TaskLogSet> = sets.into_values().collect();
    sets.sort_by_key(|s| s.last_write);

    let mut total: u64 = sets.iter().map(|s| s.bytes).sum();
    let mut removed = 0usize;
    for set in sets {
        let expired = set.last_write.map_or(true, |t| t < cutoff);
        if !expired && total <= retention.total_cap_bytes {
            continue;
        }
        for file in &set.files {
            if std::fs::remove_file(file).is_ok() {
                removed += 1;
            }
        }
        total = total.saturating_sub(set.bytes);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn age(path: &Path, secs: u64) {
        let when = SystemTime::now()
            .checked_sub(Duration::from_secs(secs))
            .expect("checked_sub");
        set_file_mtime(path, FileTime::from_system_time(when)).expect("set mtime");
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    #[test]
    fn lines_carry_task_id_and_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = TaskLog::new(&paths, "t1", TaskKind::Download);

        log.write(LogLevel::Info, "task_started", serde_json::json!({"url": "u"}))
            .expect("first");
        log.error("task_finished", serde_json::json!(null));

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "task_started");
        assert_eq!(lines[0]["kind"], "download");
        assert_eq!(lines[0]["data"]["url"], "u");
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[1]["task_id"], "t1");
    }

    #[test]
    fn full_log_rotates_and_drops_oldest_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let log = TaskLog::new(&paths, "t2", TaskKind::FetchInfo).with_retention(
            TaskLogRetention {
                rotate_bytes: 16,
                max_backups: 2,
                ..TaskLogRetention::default()
            },
        );
        std::fs::create_dir_all(paths.task_logs_dir()).expect("dir");
        std::fs::write(log.path(), "current-current-current").expect("current");
        std::fs::write(log.backup(1), "one").expect("b1");
        std::fs::write(log.backup(2), "two").expect("b2");

        log.write(LogLevel::Warn, "format_warning", serde_json::json!({}))
            .expect("write");

        assert_eq!(
            std::fs::read_to_string(log.backup(1)).expect("b1"),
            "current-current-current"
        );
        assert_eq!(std::fs::read_to_string(log.backup(2)).expect("b2"), "one");
        assert!(!log.backup(3).exists());
        assert_eq!(read_lines(log.path())[0]["event"], "format_warning");
    }

    #[test]
    fn backup_names_map_to_their_task() {
        assert_eq!(owning_task("abc.jsonl"), Some("abc"));
        assert_eq!(owning_task("abc.jsonl.2"), Some("abc"));
        assert_eq!(owning_task("abc.jsonl.tmp"), None);
        assert_eq!(owning_task("notes.txt"), None);
    }

    #[test]
    fn prune_drops_idle_tasks_with_their_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        let old = TaskLog::new(&paths, "old", TaskKind::Download);
        let recent = TaskLog::new(&paths, "recent", TaskKind::Download);
        for path in [old.path().to_path_buf(), old.backup(1), recent.path().to_path_buf()] {
            std::fs::write(&path, "{}\n").expect("seed");
        }
        age(old.path(), 40 * 24 * 60 * 60);
        age(&old.backup(1), 41 * 24 * 60 * 60);

        assert_eq!(prune(&paths, TaskLogRetention::default()).expect("prune"), 2);
        assert!(!old.path().exists());
        assert!(!old.backup(1).exists());
        assert!(recent.path().exists());
    }

    #[test]
    fn prune_enforces_cap_least_recent_task_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.task_logs_dir()).expect("dir");
        for (name, secs) in [("a", 300), ("b", 200), ("c", 100)] {
            let path = paths.task_log_path(name);
            std::fs::write(&path, "y".repeat(100)).expect("seed");
            age(&path, secs);
        }
        // An old backup does not make task c look idle.
        let c_backup = TaskLog::new(&paths, "c", TaskKind::Download).backup(1);
        std::fs::write(&c_backup, "z").expect("backup");
        age(&c_backup, 900);

        let retention = TaskLogRetention {
            total_cap_bytes: 150,
            ..TaskLogRetention::default()
        };
        assert_eq!(prune(&paths, retention).expect("prune"), 2);

        assert!(!paths.task_log_path("a").exists());
        assert!(!paths.task_log_path("b").exists());
        assert!(paths.task_log_path("c").exists());
        assert!(c_backup.exists());
    }
}
