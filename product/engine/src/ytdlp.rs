use crate::cmd;
use crate::config::EngineConfig;
use crate::engine::{
    DirectLink, DownloadRequest, Engine, LinksRequest, MediaFormat, MediaInfo, MediaItem,
    ProgressStage, ProgressUpdate,
};
use crate::error::clean_tool_message;
use crate::paths::AppPaths;
use crate::task::CancelToken;
use crate::{EngineError, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TOOL: &str = "yt-dlp";
const PROGRESS_MARK: &str = "sfprogress|";
const STAGE_MARK: &str = "sfstage|";
const FILE_MARK: &str = "sffile|";
const LINK_MARK: &str = "sflink|";
const STDERR_TAIL_LINES: usize = 200;
const EMPTY_TAB_MESSAGE: &str = "Playlist is empty, private, or could not be accessed.";

const DOWNLOAD_PROGRESS_TEMPLATE: &str = "download:sfprogress|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s|%(info.playlist_index)s|%(info.n_entries)s|%(info.title)s";
const POSTPROCESS_PROGRESS_TEMPLATE: &str = "postprocess:sfstage|%(progress.status)s|%(progress.postprocessor)s|%(info.playlist_index)s|%(info.n_entries)s|%(info.title)s";

/// Drives the yt-dlp command-line tool as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    paths: AppPaths,
    config: EngineConfig,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpEngine {
    pub fn new(paths: AppPaths, config: EngineConfig, ffmpeg_location: Option<PathBuf>) -> Self {
        Self {
            paths,
            config,
            ffmpeg_location,
        }
    }

    fn candidates(&self) -> Vec<(String, Vec<String>)> {
        let mut out: Vec<(String, Vec<String>)> = Vec::new();
        if let Some(path) = &self.config.yt_dlp_path {
            out.push((path.to_string_lossy().to_string(), Vec::new()));
        }
        let bundled = self.paths.bundled_yt_dlp_path();
        if bundled.exists() {
            out.push((bundled.to_string_lossy().to_string(), Vec::new()));
        }
        out.push((TOOL.to_string(), Vec::new()));
        for python in ["python", "python3"] {
            out.push((
                python.to_string(),
                vec!["-m".to_string(), "yt_dlp".to_string()],
            ));
        }
        out
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.cancel_poll_interval_ms)
    }

    fn network_args(&self) -> Vec<String> {
        vec![
            "--socket-timeout".to_string(),
            self.config.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            self.config.retries.to_string(),
        ]
    }

    /// Runs yt-dlp with the first executable that can be started.
    fn run(
        &self,
        args: &[String],
        cancel: &CancelToken,
        timeout_secs: u64,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<RunOutput> {
        for (program, prefix) in self.candidates() {
            let mut command = cmd::command(&program);
            command.args(&prefix);
            command.args(args);
            log::debug!("running {program} {}", args.join(" "));

            match run_streaming(&mut command, cancel, timeout_secs, self.poll_interval(), on_line) {
                Ok(output) => {
                    if !prefix.is_empty()
                        && !output.status.success()
                        && output.stderr.contains("No module named yt_dlp")
                    {
                        continue;
                    }
                    return Ok(output);
                }
                Err(RunError::Spawn(e)) if e.kind() == ErrorKind::NotFound => continue,
                Err(RunError::Spawn(e)) => {
                    return Err(EngineError::ExternalToolFailed {
                        tool: program,
                        code: None,
                        stderr: format!("could not start: {e}"),
                    })
                }
                Err(RunError::Wait(e)) => return Err(EngineError::Io(e)),
                Err(RunError::Cancelled) => return Err(EngineError::Cancelled),
                Err(RunError::TimedOut(limit)) => {
                    return Err(EngineError::ExternalToolFailed {
                        tool: program,
                        code: None,
                        stderr: format!("timed out after {limit}s"),
                    })
                }
            }
        }
        Err(EngineError::ExternalToolMissing {
            tool: TOOL.to_string(),
        })
    }

    fn info_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "--flat-playlist".to_string(),
            "--playlist-end".to_string(),
            self.config.playlist_fetch_limit.to_string(),
            "--ignore-errors".to_string(),
            "--no-warnings".to_string(),
            "--skip-download".to_string(),
        ];
        args.extend(self.network_args());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let playlist_mode = !request.playlist_items.is_empty() || is_playlist_url(&request.url);
        let template = if playlist_mode {
            "%(playlist_index)s. %(title)s.%(ext)s"
        } else {
            "%(title)s.%(ext)s"
        };

        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "-P".to_string(),
            request.work_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            template.to_string(),
            "--print".to_string(),
            format!("after_move:{FILE_MARK}%(filepath)s"),
            "--progress-template".to_string(),
            DOWNLOAD_PROGRESS_TEMPLATE.to_string(),
            "--progress-template".to_string(),
            POSTPROCESS_PROGRESS_TEMPLATE.to_string(),
            "--fragment-retries".to_string(),
            self.config.fragment_retries.to_string(),
            "--concurrent-fragments".to_string(),
            self.config.concurrent_fragments.max(1).to_string(),
        ];
        args.extend(self.network_args());
        args.extend(request.plan.yt_dlp_args());
        if let Some(ffmpeg) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().to_string());
        }
        args.extend(playlist_args(&request.url, &request.playlist_items));
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn links_args(&self, request: &LinksRequest) -> Vec<String> {
        let mut args = vec![
            "--skip-download".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            request.selector.clone(),
            "--print".to_string(),
            format!("{LINK_MARK}%(.{{title,urls,playlist_index}})j"),
        ];
        args.extend(self.network_args());
        args.extend(playlist_args(&request.url, &request.playlist_items));
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }
}

impl Engine for YtDlpEngine {
    fn fetch_info(&self, url: &str, cancel: &CancelToken) -> Result<MediaInfo> {
        cancel.check()?;
        let args = self.info_args(url);
        let output = self
            .run(&args, cancel, self.config.info_timeout_secs, &mut |_| {})
            .map_err(as_extraction_error)?;
        cancel.check()?;

        // With --ignore-errors a partially failed playlist still prints its JSON.
        let Some(json) = output.stdout.iter().rev().find(|l| l.trim_start().starts_with('{'))
        else {
            return Err(EngineError::Extraction(error_text(&output)));
        };
        let value: Value = serde_json::from_str(json)
            .map_err(|e| EngineError::Extraction(format!("unreadable metadata from yt-dlp: {e}")))?;
        parse_media_info(&value)
    }

    fn download(
        &self,
        request: &DownloadRequest,
        progress: &mut dyn FnMut(ProgressUpdate),
        cancel: &CancelToken,
    ) -> Result<Vec<PathBuf>> {
        cancel.check()?;
        std::fs::create_dir_all(&request.work_dir)?;
        let args = self.download_args(request);

        progress(ProgressUpdate::stage(ProgressStage::Starting));
        let mut reported: Vec<PathBuf> = Vec::new();
        let output = self
            .run(&args, cancel, self.config.download_timeout_secs, &mut |line| {
                if let Some(path) = line.strip_prefix(FILE_MARK) {
                    let path = path.trim();
                    if !path.is_empty() {
                        reported.push(PathBuf::from(path));
                    }
                } else if let Some(update) = parse_progress_line(line) {
                    progress(update);
                }
            })
            .map_err(as_download_error)?;
        cancel.check()?;

        let artifacts = existing_artifacts(&request.work_dir, reported);
        if artifacts.is_empty() {
            if !output.status.success() {
                return Err(EngineError::Download(error_text(&output)));
            }
            return Err(EngineError::Download(
                "yt-dlp finished without producing a file".to_string(),
            ));
        }
        if !output.status.success() {
            log::warn!(
                "yt-dlp reported errors but produced {} file(s): {}",
                artifacts.len(),
                error_text(&output)
            );
        }
        Ok(artifacts)
    }

    fn fetch_direct_links(
        &self,
        request: &LinksRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<DirectLink>> {
        cancel.check()?;
        let args = self.links_args(request);
        let mut links: Vec<DirectLink> = Vec::new();
        let output = self
            .run(&args, cancel, self.config.info_timeout_secs, &mut |line| {
                if let Some(found) = parse_link_line(line) {
                    links.extend(found);
                }
            })
            .map_err(as_extraction_error)?;
        cancel.check()?;

        if links.is_empty() {
            if !output.status.success() {
                return Err(EngineError::Extraction(error_text(&output)));
            }
            return Err(EngineError::Extraction(
                "yt-dlp found no direct links for this URL".to_string(),
            ));
        }
        Ok(links)
    }
}

fn as_extraction_error(err: EngineError) -> EngineError {
    match err {
        EngineError::ExternalToolFailed { tool, stderr, .. } => {
            EngineError::Extraction(format!("{tool}: {stderr}"))
        }
        other => other,
    }
}

fn as_download_error(err: EngineError) -> EngineError {
    match err {
        EngineError::ExternalToolFailed { tool, stderr, .. } => {
            EngineError::Download(format!("{tool}: {stderr}"))
        }
        other => other,
    }
}

fn playlist_args(url: &str, items: &[u32]) -> Vec<String> {
    if !items.is_empty() {
        let list = items
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        return vec![
            "--yes-playlist".to_string(),
            "--playlist-items".to_string(),
            list,
            "--ignore-errors".to_string(),
        ];
    }
    if is_playlist_url(url) {
        vec!["--yes-playlist".to_string(), "--ignore-errors".to_string()]
    } else {
        vec!["--no-playlist".to_string()]
    }
}

/// True for URLs that name a playlist, channel or tab rather than one video.
pub fn is_playlist_url(value: &str) -> bool {
    let Ok(parsed) = url::Url::parse(value) else {
        return false;
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let path = parsed.path().to_ascii_lowercase();
    let has_list = parsed.query_pairs().any(|(k, _)| k == "list");

    let youtube = host == "youtube.com" || host.ends_with(".youtube.com") || host == "youtu.be";
    if !youtube {
        return has_list && !path.starts_with("/watch");
    }
    if path.starts_with("/watch")
        || path.starts_with("/shorts/")
        || path.starts_with("/live/")
        || host == "youtu.be"
    {
        return false;
    }
    path.starts_with("/playlist")
        || path.starts_with("/@")
        || path.starts_with("/channel/")
        || path.starts_with("/c/")
        || path.starts_with("/user/")
        || has_list
}

fn existing_artifacts(work_dir: &Path, reported: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for path in reported {
        let path = if path.is_absolute() {
            path
        } else {
            work_dir.join(path)
        };
        if path.is_file() && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

fn error_text(output: &RunOutput) -> String {
    let cleaned = clean_tool_message(&output.stderr);
    if !cleaned.is_empty() {
        return cleaned;
    }
    match output.status.code() {
        Some(code) => format!("yt-dlp exited with code {code}"),
        None => "yt-dlp was terminated".to_string(),
    }
}

fn field(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value == "NA" || value == "None" {
        None
    } else {
        Some(value)
    }
}

fn number(value: &str) -> Option<f64> {
    field(value)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn position(value: &str) -> Option<u32> {
    number(value).filter(|v| *v >= 1.0).map(|v| v as u32)
}

/// Parses one of the machine-readable progress lines requested via
/// `--progress-template`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix(PROGRESS_MARK) {
        let parts: Vec<&str> = rest.splitn(9, '|').collect();
        if parts.len() < 9 {
            return None;
        }
        let status = parts[0];
        let downloaded = number(parts[1]);
        let total = number(parts[2]).or_else(|| number(parts[3]));
        let percent = if status == "finished" {
            Some(100.0)
        } else {
            match (downloaded, total) {
                (Some(d), Some(t)) if t > 0.0 => Some(((d / t) * 100.0).clamp(0.0, 100.0) as f32),
                _ => None,
            }
        };
        return Some(ProgressUpdate {
            stage: ProgressStage::Downloading,
            percent,
            speed: number(parts[4]).map(format_speed),
            eta: number(parts[5]).map(|s| format_eta(s as u64)),
            item_index: position(parts[6]),
            item_count: position(parts[7]),
            title: field(parts[8]).map(str::to_string),
        });
    }

    let rest = line.strip_prefix(STAGE_MARK)?;
    let parts: Vec<&str> = rest.splitn(5, '|').collect();
    if parts.len() < 5 {
        return None;
    }
    Some(ProgressUpdate {
        stage: ProgressStage::from_postprocessor(parts[1]),
        percent: None,
        speed: None,
        eta: None,
        item_index: position(parts[2]),
        item_count: position(parts[3]),
        title: field(parts[4]).map(str::to_string),
    })
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}/s", UNITS[unit])
    } else {
        format!("{value:.1} {}/s", UNITS[unit])
    }
}

pub fn format_eta(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_format(value: &Value) -> Option<MediaFormat> {
    let format_id = str_field(value, "format_id")?;
    Some(MediaFormat {
        format_id,
        ext: str_field(value, "ext"),
        height: value.get("height").and_then(Value::as_u64).map(|h| h as u32),
        vcodec: str_field(value, "vcodec"),
        acodec: str_field(value, "acodec"),
        filesize: value
            .get("filesize")
            .and_then(Value::as_u64)
            .or_else(|| value.get("filesize_approx").and_then(Value::as_u64)),
        note: str_field(value, "format_note"),
    })
}

fn parse_item(value: &Value, index: u32) -> MediaItem {
    let formats = value
        .get("formats")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(parse_format).collect())
        .unwrap_or_default();
    MediaItem {
        index,
        id: str_field(value, "id"),
        title: str_field(value, "title"),
        url: str_field(value, "webpage_url").or_else(|| str_field(value, "url")),
        duration_secs: value.get("duration").and_then(Value::as_f64),
        formats,
    }
}

/// Converts yt-dlp's `-J` output. Null playlist entries (unavailable videos)
/// are dropped but keep their position numbering.
pub fn parse_media_info(value: &Value) -> Result<MediaInfo> {
    if !value.is_object() {
        return Err(EngineError::Extraction(
            "yt-dlp returned no metadata".to_string(),
        ));
    }

    let entries = value.get("entries").and_then(Value::as_array);
    let is_playlist =
        value.get("_type").and_then(Value::as_str) == Some("playlist") || entries.is_some();

    let items: Vec<MediaItem> = if is_playlist {
        entries
            .map(|list| {
                list.iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_object())
                    .map(|(i, entry)| parse_item(entry, (i + 1) as u32))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        vec![parse_item(value, 1)]
    };

    if is_playlist && items.is_empty() {
        let extractor = str_field(value, "extractor_key").unwrap_or_default();
        if extractor.contains("YoutubeTab") {
            return Err(EngineError::Extraction(EMPTY_TAB_MESSAGE.to_string()));
        }
    }

    Ok(MediaInfo {
        title: str_field(value, "title"),
        uploader: str_field(value, "uploader").or_else(|| str_field(value, "channel")),
        duration_secs: value.get("duration").and_then(Value::as_f64),
        thumbnail: str_field(value, "thumbnail"),
        webpage_url: str_field(value, "webpage_url"),
        is_playlist,
        items,
    })
}

/// One `--print` line from a direct-link fetch; split video and audio
/// streams produce one link each.
pub fn parse_link_line(line: &str) -> Option<Vec<DirectLink>> {
    let json = line.trim().strip_prefix(LINK_MARK)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let title = str_field(&value, "title");
    let playlist_index = value
        .get("playlist_index")
        .and_then(Value::as_u64)
        .map(|i| i as u32);
    let urls = value.get("urls").and_then(Value::as_str).unwrap_or_default();
    Some(
        urls.lines()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| DirectLink {
                title: title.clone(),
                playlist_index,
                url: u.to_string(),
            })
            .collect(),
    )
}

#[derive(Debug)]
enum RunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Cancelled,
    TimedOut(u64),
}

#[derive(Debug)]
struct RunOutput {
    status: ExitStatus,
    /// Stdout lines with progress markers filtered out.
    stdout: Vec<String>,
    /// Trailing stderr lines.
    stderr: String,
}

enum StreamLine {
    Out(String),
    Err(String),
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<StreamLine>,
    wrap: fn(String) -> StreamLine,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(wrap(line)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Spawns `cmd` and feeds each output line to `on_line` as it arrives,
/// polling the cancel flag and the timeout between lines. On cancel or
/// timeout the process tree is killed.
fn run_streaming(
    cmd: &mut Command,
    cancel: &CancelToken,
    timeout_secs: u64,
    poll: Duration,
    on_line: &mut dyn FnMut(&str),
) -> std::result::Result<RunOutput, RunError> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(RunError::Spawn)?;
    let stdout = child.stdout.take().ok_or_else(|| {
        RunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        RunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing"))
    })?;

    let (tx, rx) = mpsc::channel::<StreamLine>();
    let out_reader = spawn_line_reader(stdout, tx.clone(), StreamLine::Out);
    let err_reader = spawn_line_reader(stderr, tx, StreamLine::Err);

    let started = Instant::now();
    let mut stdout_lines: Vec<String> = Vec::new();
    let mut stderr_tail: VecDeque<String> = VecDeque::new();
    let mut abort: Option<RunError> = None;

    loop {
        if cancel.is_cancelled() {
            abort = Some(RunError::Cancelled);
            break;
        }
        if timeout_secs > 0 && started.elapsed() >= Duration::from_secs(timeout_secs) {
            abort = Some(RunError::TimedOut(timeout_secs));
            break;
        }
        match rx.recv_timeout(poll) {
            Ok(StreamLine::Out(line)) => {
                on_line(&line);
                if !line.starts_with(PROGRESS_MARK) && !line.starts_with(STAGE_MARK) {
                    stdout_lines.push(line);
                }
            }
            Ok(StreamLine::Err(line)) => {
                on_line(&line);
                if stderr_tail.len() == STDERR_TAIL_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(reason) = abort {
        // Readers end on their own once the pipes close.
        cmd::kill_process_tree(&mut child);
        return Err(reason);
    }

    let status = match child.wait() {
        Ok(status) => status,
        Err(err) => {
            cmd::kill_process_tree(&mut child);
            return Err(RunError::Wait(err));
        }
    };
    let _ = out_reader.join();
    let _ = err_reader.join();

    Ok(RunOutput {
        status,
        stdout: stdout_lines,
        stderr: Vec::from(stderr_tail).join("\n"),
    })
}
