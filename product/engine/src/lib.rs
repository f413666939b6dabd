pub mod cmd;
pub mod config;
pub mod db;
pub mod engine;
mod error;
pub mod ffmpeg;
pub mod format;
pub mod history;
pub mod paths;
pub mod relay;
pub mod runner;
pub mod service;
pub mod task;
pub mod task_log;
pub mod ytdlp;

pub use error::{EngineError, Result};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
