use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.db_dir().join("history.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn task_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("tasks")
    }

    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.task_logs_dir().join(format!("{task_id}.jsonl"))
    }

    /// Root of the per-task temporary workspaces. Never inside a user destination.
    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join("work")
    }

    pub fn task_work_dir(&self, task_id: &str) -> PathBuf {
        self.work_dir().join(task_id)
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn bundled_yt_dlp_path(&self) -> PathBuf {
        with_exe_extension(self.tools_dir().join("yt-dlp").join("yt-dlp"))
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        with_exe_extension(self.ffmpeg_dir().join("ffmpeg"))
    }

    pub fn default_download_dir(&self) -> PathBuf {
        if let Some(home) = std::env::var_os("USERPROFILE").or_else(|| std::env::var_os("HOME")) {
            let downloads = PathBuf::from(home).join("Downloads");
            if downloads.is_dir() {
                return downloads;
            }
        }
        self.base_dir.join("downloads")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.task_logs_dir())?;
        std::fs::create_dir_all(self.work_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }

    pub fn normalize_base_dir(base_dir: &Path) -> PathBuf {
        if base_dir.is_absolute() {
            return base_dir.to_path_buf();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(base_dir),
            Err(_) => base_dir.to_path_buf(),
        }
    }
}

fn with_exe_extension(mut path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}
