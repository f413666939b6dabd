use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Explicit yt-dlp executable; otherwise the bundled copy, then PATH.
    pub yt_dlp_path: Option<PathBuf>,
    /// Explicit ffmpeg executable or directory handed to yt-dlp.
    pub ffmpeg_location: Option<PathBuf>,
    pub default_download_dir: Option<PathBuf>,
    pub playlist_fetch_limit: usize,
    pub socket_timeout_secs: u64,
    pub retries: u32,
    pub fragment_retries: u32,
    pub concurrent_fragments: u32,
    pub info_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub cancel_poll_interval_ms: u64,
    pub event_channel_capacity: usize,
    /// Also write info fetches and link fetches to history.
    pub record_lookups_in_history: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: None,
            ffmpeg_location: None,
            default_download_dir: None,
            playlist_fetch_limit: 500,
            socket_timeout_secs: 30,
            retries: 5,
            fragment_retries: 5,
            concurrent_fragments: 4,
            info_timeout_secs: 900,
            download_timeout_secs: 7200,
            cancel_poll_interval_ms: 200,
            event_channel_capacity: 256,
            record_lookups_in_history: false,
        }
    }
}

impl EngineConfig {
    pub fn download_dir(&self, paths: &AppPaths) -> PathBuf {
        self.default_download_dir
            .clone()
            .unwrap_or_else(|| paths.default_download_dir())
    }

    fn normalized(mut self) -> Self {
        self.playlist_fetch_limit = self.playlist_fetch_limit.max(1);
        self.cancel_poll_interval_ms = self.cancel_poll_interval_ms.clamp(10, 5_000);
        self.event_channel_capacity = self.event_channel_capacity.max(1);
        self
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed.normalized())
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let config = load_engine_config(&paths).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.playlist_fetch_limit, 500);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(
            paths.engine_config_path(),
            r#"{ "retries": 9, "event_channel_capacity": 0 }"#,
        )
        .expect("write");

        let config = load_engine_config(&paths).expect("load");
        assert_eq!(config.retries, 9);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.fragment_retries, 5);
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let config = EngineConfig {
            ffmpeg_location: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            record_lookups_in_history: true,
            ..EngineConfig::default()
        };
        save_engine_config(&paths, &config).expect("save");
        assert_eq!(load_engine_config(&paths).expect("load"), config);
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        std::fs::create_dir_all(paths.config_dir()).expect("config dir");
        std::fs::write(paths.engine_config_path(), "{ not json").expect("write");
        let err = load_engine_config(&paths).expect_err("must fail");
        assert!(matches!(err, EngineError::Config(_)));
    }
}
