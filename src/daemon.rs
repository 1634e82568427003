//! Background loops feeding the history service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::clipboard::{Clipboard, ClipboardEventSource};
use crate::config::Config;
use crate::history::HistoryEngine;
use crate::keys::{ChordDetector, ChordEvent, KeyboardDevice};
use crate::service::{HistoryHandle, HistoryService, ServiceStats};
use crate::store::HistoryStore;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Platform capabilities the daemon runs on.
pub struct DaemonParts<S, K, W, R> {
    pub store: S,
    pub keyboard: K,
    /// Clipboard owned by the history service for recalled slots.
    pub writer: W,
    /// Clipboard polled for changes, when automatic capture is enabled.
    pub watcher: Option<R>,
    /// Clipboard read by the Ctrl+C capture hotkey.
    pub capture_reader: Option<R>,
}

pub fn run_daemon<S, K, W, R>(
    parts: DaemonParts<S, K, W, R>,
    config: &Config,
    shutdown: Arc<AtomicBool>,
) -> Result<ServiceStats>
where
    S: HistoryStore + Send + 'static,
    K: KeyboardDevice + 'static,
    W: Clipboard + 'static,
    R: Clipboard + 'static,
{
    let mut engine = HistoryEngine::with_match_mode(parts.store, config.match_mode);
    if engine.normalize().context("Failed to check stored history")? {
        warn!("stored history had gaps or duplicates and was rewritten");
    }
    let service = HistoryService::spawn(engine, parts.writer)?;

    info!(device = %parts.keyboard.name(), "listening for Ctrl+Shift+1..9");
    let capture_reader = if config.capture_hotkey { parts.capture_reader } else { None };
    let keyboard_handle = spawn_keyboard_loop(
        parts.keyboard,
        ChordDetector::new(capture_reader.is_some()),
        service.handle(),
        capture_reader,
        Duration::from_millis(config.capture_delay_ms),
        shutdown.clone(),
    )?;

    let watch_handle = match parts.watcher {
        Some(watcher) if config.watch_clipboard => Some(spawn_clipboard_watch(
            watcher,
            service.handle(),
            Duration::from_millis(config.clipboard_poll_ms),
            shutdown.clone(),
        )?),
        _ => None,
    };

    while !shutdown.load(Ordering::SeqCst) && !keyboard_handle.is_finished() {
        thread::sleep(SHUTDOWN_POLL);
    }
    shutdown.store(true, Ordering::SeqCst);

    if let Some(handle) = watch_handle {
        handle.join().ok();
    }
    // The keyboard thread may sit in a blocking read; it exits on its next event.
    let keyboard_result = if keyboard_handle.is_finished() {
        keyboard_handle
            .join()
            .unwrap_or_else(|_| Err(anyhow!("keyboard thread panicked")))
    } else {
        Ok(())
    };
    let stats = service.shutdown()?;
    keyboard_result.context("Keyboard device lost")?;
    Ok(stats)
}

pub fn spawn_keyboard_loop<K, R>(
    device: K,
    detector: ChordDetector,
    handle: HistoryHandle,
    capture_reader: Option<R>,
    capture_delay: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<Result<()>>>
where
    K: KeyboardDevice + 'static,
    R: Clipboard + 'static,
{
    thread::Builder::new()
        .name("clipcapsule-keyboard".to_string())
        .spawn(move || {
            let result = run_keyboard_loop(device, detector, &handle, capture_reader, capture_delay, &shutdown);
            if let Err(err) = &result {
                error!("keyboard loop stopped: {err:#}");
            }
            result
        })
        .context("Failed to spawn keyboard thread")
}

fn run_keyboard_loop<K, R>(
    mut device: K,
    mut detector: ChordDetector,
    handle: &HistoryHandle,
    mut capture_reader: Option<R>,
    capture_delay: Duration,
    shutdown: &AtomicBool,
) -> Result<()>
where
    K: KeyboardDevice,
    R: Clipboard,
{
    while !shutdown.load(Ordering::SeqCst) {
        let events = device.next_events()?;
        for (key, transition) in events {
            let Some(chord) = detector.handle(key, transition) else {
                continue;
            };
            match chord {
                ChordEvent::Select(slot) => {
                    debug!(slot, "recall chord");
                    handle.select(slot)?;
                }
                ChordEvent::CaptureCurrent => {
                    let Some(reader) = capture_reader.as_mut() else {
                        continue;
                    };
                    // The focused app updates the clipboard after the key press.
                    thread::sleep(capture_delay);
                    match reader.read_text() {
                        Ok(Some(text)) if !text.is_empty() => handle.submit_clip(text)?,
                        Ok(_) => debug!("capture hotkey with empty clipboard"),
                        Err(err) => warn!("capture hotkey read failed: {err:#}"),
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn spawn_clipboard_watch<R>(
    clipboard: R,
    handle: HistoryHandle,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>>
where
    R: Clipboard + 'static,
{
    thread::Builder::new()
        .name("clipcapsule-clipboard".to_string())
        .spawn(move || run_clipboard_watch(clipboard, &handle, poll, &shutdown))
        .context("Failed to spawn clipboard watch thread")
}

fn run_clipboard_watch<R: Clipboard>(mut clipboard: R, handle: &HistoryHandle, poll: Duration, shutdown: &AtomicBool) {
    let mut source = ClipboardEventSource::new();
    let mut read_failing = false;
    while !shutdown.load(Ordering::SeqCst) {
        match clipboard.read_text() {
            Ok(Some(text)) => {
                read_failing = false;
                if let Some(content) = source.observe(&text) {
                    if let Err(err) = handle.submit_clip(content) {
                        error!("clipboard watch stopped: {err:#}");
                        return;
                    }
                }
            }
            Ok(None) => read_failing = false,
            Err(err) => {
                // Log once per failure streak; a missing selection owner fails every poll.
                if !read_failing {
                    warn!("clipboard read failed: {err:#}");
                }
                read_failing = true;
            }
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::keys::{Key, Transition};
    use crate::store::SqliteStore;
    use pretty_assertions::assert_eq;

    /// Replays batches, then either requests shutdown or fails like an unplugged device.
    struct ScriptedKeyboard {
        batches: VecDeque<Vec<(Key, Transition)>>,
        shutdown: Option<Arc<AtomicBool>>,
    }

    impl ScriptedKeyboard {
        fn new(batches: Vec<Vec<(Key, Transition)>>, shutdown: &Arc<AtomicBool>) -> Self {
            Self {
                batches: batches.into(),
                shutdown: Some(shutdown.clone()),
            }
        }

        fn unplugged_after(batches: Vec<Vec<(Key, Transition)>>) -> Self {
            Self {
                batches: batches.into(),
                shutdown: None,
            }
        }
    }

    impl KeyboardDevice for ScriptedKeyboard {
        fn next_events(&mut self) -> Result<Vec<(Key, Transition)>> {
            if let Some(batch) = self.batches.pop_front() {
                return Ok(batch);
            }
            match &self.shutdown {
                Some(flag) => {
                    flag.store(true, Ordering::SeqCst);
                    Ok(Vec::new())
                }
                None => Err(anyhow!("No such device (os error 19)")),
            }
        }
    }

    fn seeded_store(path: &std::path::Path, items: &[&str]) -> SqliteStore {
        let mut store = SqliteStore::open(path).unwrap();
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        store.replace_all(&items).unwrap();
        store
    }

    fn stored(path: &std::path::Path) -> Vec<String> {
        SqliteStore::open(path)
            .unwrap()
            .fetch_all_ordered()
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect()
    }

    fn chord(digit: u8) -> Vec<(Key, Transition)> {
        vec![
            (Key::LeftCtrl, Transition::Down),
            (Key::LeftShift, Transition::Down),
            (Key::Digit(digit), Transition::Down),
            (Key::Digit(digit), Transition::Repeat),
            (Key::Digit(digit), Transition::Repeat),
            (Key::Digit(digit), Transition::Up),
            (Key::LeftShift, Transition::Up),
            (Key::LeftCtrl, Transition::Up),
        ]
    }

    #[test]
    fn held_chord_promotes_once_and_sets_clipboard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let writer = MemoryClipboard::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let parts = DaemonParts {
            store: seeded_store(&path, &["c1", "c2", "c3"]),
            keyboard: ScriptedKeyboard::new(vec![chord(2)], &shutdown),
            writer: writer.clone(),
            watcher: None::<MemoryClipboard>,
            capture_reader: None,
        };

        let stats = run_daemon(parts, &Config::default(), shutdown).unwrap();
        assert_eq!(stats.selections, 1);
        assert_eq!(writer.writes(), vec!["c2".to_string()]);
        assert_eq!(stored(&path), vec!["c2", "c1", "c3"]);
    }

    #[test]
    fn capture_hotkey_reads_clipboard_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let system = MemoryClipboard::new();
        system.set("copied text");
        let config = Config {
            capture_hotkey: true,
            capture_delay_ms: 0,
            ..Config::default()
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let parts = DaemonParts {
            store: seeded_store(&path, &["older"]),
            keyboard: ScriptedKeyboard::new(
                vec![vec![
                    (Key::RightCtrl, Transition::Down),
                    (Key::C, Transition::Down),
                    (Key::C, Transition::Up),
                ]],
                &shutdown,
            ),
            writer: system.clone(),
            watcher: None,
            capture_reader: Some(system.clone()),
        };

        let stats = run_daemon(parts, &config, shutdown).unwrap();
        assert_eq!(stats.clips_stored, 1);
        assert_eq!(stored(&path), vec!["copied text", "older"]);
    }

    #[test]
    fn watch_loop_submits_distinct_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let store = seeded_store(&path, &[]);
        let clipboard = MemoryClipboard::new();
        let service = HistoryService::spawn(HistoryEngine::new(store), MemoryClipboard::new()).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let watch = spawn_clipboard_watch(
            clipboard.clone(),
            service.handle(),
            Duration::from_millis(5),
            shutdown.clone(),
        )
        .unwrap();

        clipboard.set("first");
        wait_for(&service.handle(), 1);
        clipboard.set("second");
        wait_for(&service.handle(), 2);

        shutdown.store(true, Ordering::SeqCst);
        watch.join().unwrap();
        let contents: Vec<String> = service
            .handle()
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["second", "first"]);
        assert_eq!(service.shutdown().unwrap().clips_stored, 2);
    }

    fn wait_for(handle: &HistoryHandle, len: usize) {
        for _ in 0..500 {
            if handle.snapshot().unwrap().len() >= len {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("history never reached {len} entries");
    }

    #[test]
    fn corrupt_history_is_repaired_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE clipboard_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    content TEXT NOT NULL,
                    position INTEGER NOT NULL
                 );
                 INSERT INTO clipboard_items (content, position) VALUES ('x', 3);
                 INSERT INTO clipboard_items (content, position) VALUES ('y', 3);
                 INSERT INTO clipboard_items (content, position) VALUES ('x', 9);",
            )
            .unwrap();
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let parts = DaemonParts {
            store: SqliteStore::open(&path).unwrap(),
            keyboard: ScriptedKeyboard::new(Vec::new(), &shutdown),
            writer: MemoryClipboard::new(),
            watcher: None::<MemoryClipboard>,
            capture_reader: None,
        };
        run_daemon(parts, &Config::default(), shutdown).unwrap();
        let entries = SqliteStore::open(&path).unwrap().fetch_all_ordered().unwrap();
        let positions: Vec<i64> = entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1]);
        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["x", "y"]);
    }

    #[test]
    fn lost_keyboard_fails_the_daemon_after_draining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let writer = MemoryClipboard::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let parts = DaemonParts {
            store: seeded_store(&path, &["c1", "c2"]),
            keyboard: ScriptedKeyboard::unplugged_after(vec![chord(2)]),
            writer: writer.clone(),
            watcher: None::<MemoryClipboard>,
            capture_reader: None,
        };

        let err = run_daemon(parts, &Config::default(), shutdown.clone()).unwrap_err();
        assert!(format!("{err:#}").contains("No such device"));
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(writer.writes(), vec!["c2".to_string()]);
        assert_eq!(stored(&path), vec!["c2", "c1"]);
    }
}
