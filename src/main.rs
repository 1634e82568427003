use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::info;

use clipcapsule::clipboard::MemoryClipboard;
use clipcapsule::config::{self, CliOverrides, APP_DIR};
use clipcapsule::history::{HistoryEngine, SLOT_COUNT};
use clipcapsule::logging;
use clipcapsule::service::{preview, HistoryService};
use clipcapsule::store::{HistoryStore, SqliteStore};

const LOCK_FILE: &str = "clipcapsule.lock";
const STOP_FILE: &str = "stop.signal";
const DEFAULT_LIST_LIMIT: usize = 20;

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("start") => {
            let overrides = parse_start_args(args);
            run_start(overrides)?;
        }
        Some("stop") => {
            stop_daemon()?;
        }
        Some("status") => {
            let overrides = parse_start_args(args);
            print_status(&overrides)?;
        }
        Some("list") => {
            let (overrides, limit) = parse_list_args(args);
            print_history(&overrides, limit)?;
        }
        Some("move") => {
            let (overrides, positions) = parse_move_args(args);
            match positions {
                Some((from, to)) => move_entry(&overrides, from, to)?,
                None => print_usage(),
            }
        }
        _ => {
            print_usage();
        }
    }
    Ok(())
}

fn print_usage() {
    println!("clipcapsule");
    println!("Usage:");
    println!("  clipcapsule start [--config PATH] [--db PATH] [--device PATH] [--watch|--no-watch]");
    println!("                    [--capture-hotkey|--no-capture-hotkey] [--poll-ms N]");
    println!("  clipcapsule stop");
    println!("  clipcapsule status [--config PATH] [--db PATH]");
    println!("  clipcapsule list [--config PATH] [--db PATH] [--limit N]");
    println!("  clipcapsule move FROM TO [--config PATH] [--db PATH]");
}

fn parse_start_args(mut args: impl Iterator<Item = String>) -> CliOverrides {
    let mut overrides = CliOverrides::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(value) = args.next() {
                    overrides.config_path = Some(PathBuf::from(value));
                }
            }
            "--db" => {
                if let Some(value) = args.next() {
                    overrides.db_path = Some(value);
                }
            }
            "--device" => {
                if let Some(value) = args.next() {
                    overrides.keyboard_device = Some(value);
                }
            }
            "--watch" => {
                overrides.watch_clipboard = Some(true);
            }
            "--no-watch" => {
                overrides.watch_clipboard = Some(false);
            }
            "--capture-hotkey" => {
                overrides.capture_hotkey = Some(true);
            }
            "--no-capture-hotkey" => {
                overrides.capture_hotkey = Some(false);
            }
            "--poll-ms" => {
                if let Some(value) = args.next() {
                    if let Ok(parsed) = value.parse::<u64>() {
                        overrides.clipboard_poll_ms = Some(parsed);
                    }
                }
            }
            _ => {}
        }
    }
    overrides
}

fn parse_list_args(mut args: impl Iterator<Item = String>) -> (CliOverrides, usize) {
    let mut limit = DEFAULT_LIST_LIMIT;
    let mut rest = Vec::new();
    while let Some(arg) = args.next() {
        if arg == "--limit" {
            if let Some(value) = args.next() {
                if let Ok(parsed) = value.parse::<usize>() {
                    limit = parsed.max(1);
                }
            }
        } else {
            rest.push(arg);
        }
    }
    (parse_start_args(rest.into_iter()), limit)
}

/// Positions are 1-based, matching `list` output.
fn parse_move_args(mut args: impl Iterator<Item = String>) -> (CliOverrides, Option<(usize, usize)>) {
    let mut positions = Vec::new();
    let mut rest = Vec::new();
    while let Some(arg) = args.next() {
        if matches!(arg.as_str(), "--config" | "--db") {
            rest.push(arg);
            rest.extend(args.next());
        } else if let Ok(parsed) = arg.parse::<usize>() {
            positions.push(parsed);
        }
    }
    let pair = match positions.as_slice() {
        [from, to] if *from >= 1 && *to >= 1 => Some((*from, *to)),
        _ => None,
    };
    (parse_start_args(rest.into_iter()), pair)
}

fn ensure_app_dir() -> Result<PathBuf> {
    let cwd = env::current_dir().context("Failed to read current dir")?;
    let base_dir = cwd.join(APP_DIR);
    if !base_dir.exists() {
        fs::create_dir_all(&base_dir).context("Failed to create clipcapsule data dir")?;
    }
    Ok(base_dir)
}

fn run_start(overrides: CliOverrides) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = config::load_config(&base_dir, &overrides)?;
    logging::init_logging(&config.log_filter);

    let lock_path = base_dir.join(LOCK_FILE);
    if lock_path.exists() {
        match read_lock_info(&lock_path).and_then(|info| info.pid) {
            Some(pid) if !is_pid_running(pid) => {
                let _ = fs::remove_file(&lock_path);
                println!("Cleared stale lock from pid {pid}.");
            }
            _ => {
                println!("clipcapsule already running (lock file present).");
                return Ok(());
            }
        }
    }
    let stop_path = base_dir.join(STOP_FILE);
    let _ = fs::remove_file(&stop_path);

    let db_path = config.resolve_db_path(&base_dir);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open history database {}", db_path.display()))?;
    info!(path = %db_path.display(), "history database ready");

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            shutdown.store(true, Ordering::SeqCst);
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    write_lock(&lock_path)?;
    let stop_handle = spawn_stop_watcher(stop_path, shutdown.clone());
    let result = platform::run(store, &config, shutdown.clone());
    shutdown.store(true, Ordering::SeqCst);
    stop_handle.join().ok();
    let _ = fs::remove_file(&lock_path);

    let stats = result?;
    info!(
        stored = stats.clips_stored,
        selections = stats.selections,
        storage_errors = stats.storage_errors,
        clipboard_errors = stats.clipboard_errors,
        "clipcapsule stopped"
    );
    Ok(())
}

#[cfg(all(feature = "evdev", feature = "arboard"))]
mod platform {
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use anyhow::Result;

    use clipcapsule::clipboard::SystemClipboard;
    use clipcapsule::config::Config;
    use clipcapsule::daemon::{run_daemon, DaemonParts};
    use clipcapsule::keys::EvdevKeyboard;
    use clipcapsule::service::ServiceStats;
    use clipcapsule::store::SqliteStore;

    pub fn run(store: SqliteStore, config: &Config, shutdown: Arc<AtomicBool>) -> Result<ServiceStats> {
        let keyboard = match config.keyboard_device.as_deref() {
            Some(path) => EvdevKeyboard::open(Path::new(path))?,
            None => EvdevKeyboard::find()?,
        };
        let watcher = if config.watch_clipboard {
            Some(SystemClipboard::new()?)
        } else {
            None
        };
        let capture_reader = if config.capture_hotkey {
            Some(SystemClipboard::new()?)
        } else {
            None
        };
        let parts = DaemonParts {
            store,
            keyboard,
            writer: SystemClipboard::new()?,
            watcher,
            capture_reader,
        };
        run_daemon(parts, config, shutdown)
    }
}

#[cfg(not(all(feature = "evdev", feature = "arboard")))]
mod platform {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use anyhow::Result;

    use clipcapsule::config::Config;
    use clipcapsule::service::ServiceStats;
    use clipcapsule::store::SqliteStore;

    pub fn run(_store: SqliteStore, _config: &Config, _shutdown: Arc<AtomicBool>) -> Result<ServiceStats> {
        anyhow::bail!("clipcapsule was built without keyboard/clipboard support; enable the `evdev` and `arboard` features")
    }
}

fn spawn_stop_watcher(stop_path: PathBuf, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let interval = Duration::from_millis(200);
        while !shutdown.load(Ordering::SeqCst) {
            if stop_path.exists() {
                let _ = fs::remove_file(&stop_path);
                info!("stop signal received");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            thread::sleep(interval);
        }
    })
}

fn stop_daemon() -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        println!("No running clipcapsule found.");
        return Ok(());
    }
    let stop_path = base_dir.join(STOP_FILE);
    fs::write(&stop_path, b"stop")?;
    println!("Stop signal written.");
    if let Some(pid) = read_lock_info(&lock_path).and_then(|info| info.pid) {
        if !is_pid_running(pid) {
            let _ = fs::remove_file(&lock_path);
            let _ = fs::remove_file(&stop_path);
            println!("clipcapsule was not running; stale lock cleared.");
        }
    }
    Ok(())
}

fn print_status(overrides: &CliOverrides) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let lock_path = base_dir.join(LOCK_FILE);
    match read_lock_info(&lock_path) {
        None => println!("clipcapsule status: stopped"),
        Some(info) => {
            if info.pid.map(is_pid_running) == Some(false) {
                let _ = fs::remove_file(&lock_path);
                println!("clipcapsule status: stopped (stale lock cleared)");
            } else {
                println!("clipcapsule status: running");
                if !info.raw.trim().is_empty() {
                    println!("{}", info.raw.trim_end());
                }
            }
        }
    }

    let config = config::load_config(&base_dir, overrides)?;
    let db_path = config.resolve_db_path(&base_dir);
    if db_path.exists() {
        let store = SqliteStore::open_read_only(&db_path)
            .with_context(|| format!("Failed to open history database {}", db_path.display()))?;
        println!("entries: {}", store.count()?);
        println!("database: {}", db_path.display());
    } else {
        println!("database: {} (not created yet)", db_path.display());
    }
    Ok(())
}

fn print_history(overrides: &CliOverrides, limit: usize) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = config::load_config(&base_dir, overrides)?;
    let db_path = config.resolve_db_path(&base_dir);
    if !db_path.exists() {
        println!("History is empty.");
        return Ok(());
    }
    let store = SqliteStore::open_read_only(&db_path)
        .with_context(|| format!("Failed to open history database {}", db_path.display()))?;
    let entries = store.fetch_all_ordered()?;
    if entries.is_empty() {
        println!("History is empty.");
        return Ok(());
    }
    for entry in entries.iter().take(limit) {
        let slot = entry.position + 1;
        let label = if slot <= i64::from(SLOT_COUNT) {
            format!("[{slot}]")
        } else {
            "   ".to_string()
        };
        println!("{label} {}", preview(&entry.content));
    }
    if entries.len() > limit {
        println!("... {} more", entries.len() - limit);
    }
    Ok(())
}

fn move_entry(overrides: &CliOverrides, from: usize, to: usize) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = config::load_config(&base_dir, overrides)?;
    logging::init_logging(&config.log_filter);
    let db_path = config.resolve_db_path(&base_dir);
    if !db_path.exists() {
        println!("History is empty.");
        return Ok(());
    }
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open history database {}", db_path.display()))?;
    // Reordering never sets the clipboard, so the service gets a detached one.
    let service = HistoryService::spawn(
        HistoryEngine::with_match_mode(store, config.match_mode),
        MemoryClipboard::new(),
    )?;
    let moved = service.handle().move_entry(from - 1, to - 1);
    service.shutdown()?;
    if moved? {
        println!("Moved entry {from} to {to}.");
    } else {
        println!("Entry {from} is already at {to}.");
    }
    Ok(())
}

fn write_lock(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let started = DateTime::<Local>::from(SystemTime::now()).to_rfc3339();
    let contents = format!("pid={pid}\nstarted={started}\n");
    fs::write(path, contents).context("Failed to write lock file")?;
    Ok(())
}

struct LockInfo {
    pid: Option<u32>,
    raw: String,
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(path).ok()?;
    let mut pid = None;
    for line in contents.lines() {
        let mut parts = line.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        if key == "pid" {
            if let Ok(parsed) = value.parse::<u32>() {
                pid = Some(parsed);
            }
        }
    }
    Some(LockInfo { pid, raw: contents })
}

fn is_pid_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
