use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use spiderfetch_engine::paths::AppPaths;
use spiderfetch_engine::relay::{TaskEvent, TaskEventKind};
use spiderfetch_engine::service::DownloadService;
use spiderfetch_engine::task::{TaskOptions, TaskOutput, TaskSnapshot, TaskStatus};

fn main() -> Result<(), String> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut format: Option<String> = None;
    let mut dest: Option<PathBuf> = None;
    let mut audio_only = false;
    let mut items: Vec<u32> = Vec::new();
    let mut limit: usize = 50;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => base_dir = Some(PathBuf::from(value_of(&args, &mut i, "--base-dir")?)),
            "--format" => format = Some(value_of(&args, &mut i, "--format")?),
            "--dest" => dest = Some(PathBuf::from(value_of(&args, &mut i, "--dest")?)),
            "--audio" => audio_only = true,
            "--items" => items = parse_items(&value_of(&args, &mut i, "--items")?)?,
            "--limit" => {
                limit = value_of(&args, &mut i, "--limit")?
                    .parse()
                    .map_err(|_| "--limit needs a number".to_string())?
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"))
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(AppPaths::normalize_base_dir(&base_dir));

    let command = positional.first().map(String::as_str).unwrap_or_default();
    let options = TaskOptions {
        format: format.unwrap_or_else(|| "best".to_string()),
        destination: dest,
        audio_only,
        playlist_items: items,
    };

    let service = DownloadService::start_default(paths).map_err(|e| e.to_string())?;
    let result = match command {
        "info" | "download" | "links" => {
            let url = positional
                .get(1)
                .ok_or_else(|| format!("{command} requires a URL"))?;
            run_task(&service, command, url, options)
        }
        "history" => run_history(&service, &positional[1..], limit),
        other => Err(format!("unknown command: {other} (try --help)")),
    };
    service.shutdown();
    result
}

fn value_of(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_items(value: &str) -> Result<Vec<u32>, String> {
    let mut out: Vec<u32> = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let n: u32 = part
            .parse()
            .map_err(|_| format!("invalid playlist item: {part}"))?;
        if n == 0 {
            return Err("playlist items start at 1".to_string());
        }
        if !out.contains(&n) {
            out.push(n);
        }
    }
    Ok(out)
}

fn run_task(
    service: &DownloadService,
    command: &str,
    url: &str,
    options: TaskOptions,
) -> Result<(), String> {
    let events = service.subscribe();
    let task = match command {
        "info" => service.fetch_info(url),
        "download" => service.download(url, options),
        _ => service.fetch_links(url, options),
    }
    .map_err(|e| e.to_string())?;

    let done = wait_for_task(service, &events, &task.id)?;
    match done.status {
        TaskStatus::Completed => {
            print_output(&done)?;
            Ok(())
        }
        TaskStatus::Cancelled => Err("canceled".to_string()),
        _ => Err(done.error.unwrap_or_else(|| "task failed".to_string())),
    }
}

fn wait_for_task(
    service: &DownloadService,
    events: &Receiver<TaskEvent>,
    task_id: &str,
) -> Result<TaskSnapshot, String> {
    loop {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(event) if event.task_id == task_id => show_event(&event),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(Duration::from_millis(300)),
        }

        // Events may be dropped; the queue is authoritative.
        let snapshot = service
            .task(task_id)
            .ok_or_else(|| "task disappeared from the queue".to_string())?;
        if snapshot.status.is_terminal() {
            eprintln!();
            // A history failure is reported right after the terminal event.
            while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
                if event.task_id == task_id {
                    show_event(&event);
                }
            }
            return Ok(snapshot);
        }
    }
}

fn show_event(event: &TaskEvent) {
    match &event.kind {
        TaskEventKind::Snapshot { snapshot } if snapshot.status == TaskStatus::Running => {
            let p = &snapshot.progress;
            let mut line = format!("\r{:>5.1}%", p.percent);
            if let Some(stage) = &p.stage {
                line.push_str(&format!(" {stage}"));
            }
            if let (Some(i), Some(n)) = (p.item_index, p.item_count) {
                line.push_str(&format!(" [{i}/{n}]"));
            }
            if let Some(speed) = &p.speed {
                line.push_str(&format!(" {speed}"));
            }
            if let Some(eta) = &p.eta {
                line.push_str(&format!(" eta {eta}"));
            }
            eprint!("{line:<60}");
            let _ = std::io::stderr().flush();
        }
        TaskEventKind::HistoryWriteFailed { message } => {
            eprintln!("warning: history entry was not saved: {message}");
        }
        _ => {}
    }
}

fn print_output(snapshot: &TaskSnapshot) -> Result<(), String> {
    match &snapshot.output {
        Some(TaskOutput::Files { paths }) => {
            for path in paths {
                println!("{}", path.to_string_lossy());
            }
        }
        Some(TaskOutput::Links { links }) => {
            for link in links {
                println!("{}", link.url);
            }
        }
        Some(TaskOutput::Info { info }) => {
            let json = serde_json::to_string_pretty(info).map_err(|e| e.to_string())?;
            println!("{json}");
        }
        None => {}
    }
    Ok(())
}

fn run_history(service: &DownloadService, args: &[String], limit: usize) -> Result<(), String> {
    match args.first().map(String::as_str).unwrap_or("list") {
        "list" => {
            for entry in service.history_entries().take(limit) {
                let entry = entry.map_err(|e| e.to_string())?;
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.id,
                    entry.operation.as_str(),
                    entry.title.as_deref().unwrap_or("-"),
                    entry.url,
                    entry.dest_path.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        "delete" => {
            let id: i64 = args
                .get(1)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| "history delete requires a numeric id".to_string())?;
            if service.delete_history(id).map_err(|e| e.to_string())? {
                println!("deleted {id}");
                Ok(())
            } else {
                Err(format!("no history entry with id {id}"))
            }
        }
        "clear" => {
            let removed = service.clear_history().map_err(|e| e.to_string())?;
            println!("removed {removed} entries");
            Ok(())
        }
        other => Err(format!("unknown history command: {other}")),
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("SPIDERFETCH_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("spiderfetch"));
            }
        }
    }

    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share/spiderfetch"))
}

fn print_help() {
    println!(
        r#"spiderfetch

Usage:
  spiderfetch info <url>
  spiderfetch download <url> [--format best|720p|audio-mp3] [--audio] [--items 1,3] [--dest DIR]
  spiderfetch links <url> [--format F] [--audio] [--items 1,3]
  spiderfetch history [list [--limit N] | delete ID | clear]

Options:
  --base-dir <path>   Data directory (or set SPIDERFETCH_BASE_DIR)

Logging goes to stderr; set RUST_LOG=debug for more detail.
"#
    );
}
