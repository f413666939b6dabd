use crate::cmd;
use crate::config::EngineConfig;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Finds an ffmpeg that actually runs: the configured location, the bundled
/// copy, then `ffmpeg` on PATH.
pub fn locate(paths: &AppPaths, config: &EngineConfig) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(configured) = &config.ffmpeg_location {
        if configured.is_dir() {
            candidates.push(configured.join(paths.ffmpeg_bin_path().file_name()?));
        } else {
            candidates.push(configured.clone());
        }
    }
    candidates.push(paths.ffmpeg_bin_path());
    candidates.push(PathBuf::from("ffmpeg"));

    for candidate in candidates {
        match version(&candidate) {
            Ok(line) => {
                log::info!("using ffmpeg at {} ({line})", candidate.display());
                warn_if_ffprobe_missing(&candidate);
                return Some(candidate);
            }
            Err(err) => log::debug!("ffmpeg candidate {} rejected: {err}", candidate.display()),
        }
    }
    log::warn!("ffmpeg not found; merging and MP3 conversion are unavailable");
    None
}

/// First line of `ffmpeg -version`.
pub fn version(program: &Path) -> Result<String> {
    let output = cmd::command(program)
        .arg("-version")
        .stderr(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: String::new(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

fn warn_if_ffprobe_missing(ffmpeg: &Path) {
    // Only checkable when ffmpeg came from a real directory.
    let Some(dir) = ffmpeg.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    let name = if cfg!(windows) { "ffprobe.exe" } else { "ffprobe" };
    if !dir.join(name).exists() {
        log::warn!(
            "ffprobe is missing next to {}; some post-processing steps may fail",
            ffmpeg.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_reported_as_missing_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = version(&dir.path().join("no-such-ffmpeg")).expect_err("must fail");
        assert!(matches!(err, EngineError::ExternalToolMissing { .. }));
    }
}
