//! Single owner of the history engine.
//!
//! Event loops never touch the store directly. They queue [`Command`]s and the
//! service thread applies them one at a time, so no two list replacements can
//! interleave. Reads for display go through the same queue.

use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::clipboard::Clipboard;
use crate::error::{StorageError, StorageResult};
use crate::history::{ClipOutcome, HistoryEngine};
use crate::store::{ClipboardEntry, HistoryStore};

const QUEUE_CAPACITY: usize = 1024;
const PREVIEW_CHARS: usize = 20;

pub enum Command {
    NewClip(String),
    Select(u8),
    /// 0-based positions; the reply carries whether the order changed.
    Move {
        from: usize,
        to: usize,
        reply: Sender<StorageResult<bool>>,
    },
    Reorder {
        ordered: Vec<String>,
        reply: Sender<StorageResult<bool>>,
    },
    Snapshot(Sender<StorageResult<Vec<ClipboardEntry>>>),
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    pub clips_stored: u64,
    pub clips_skipped: u64,
    pub selections: u64,
    pub reorders: u64,
    pub storage_errors: u64,
    pub clipboard_errors: u64,
}

/// Cheap cloneable sender side used by the event loops.
#[derive(Clone)]
pub struct HistoryHandle {
    sender: Sender<Command>,
}

impl HistoryHandle {
    pub fn submit_clip(&self, content: String) -> Result<()> {
        self.send(Command::NewClip(content))
    }

    pub fn select(&self, slot: u8) -> Result<()> {
        self.send(Command::Select(slot))
    }

    pub fn move_entry(&self, from: usize, to: usize) -> Result<bool> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Move {
            from,
            to,
            reply: reply_tx,
        })?;
        Self::await_reply(reply_rx).context("Failed to move history entry")
    }

    pub fn reorder(&self, ordered: Vec<String>) -> Result<bool> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Reorder {
            ordered,
            reply: reply_tx,
        })?;
        Self::await_reply(reply_rx).context("Failed to reorder history")
    }

    /// Current list, ordered after every command queued before this call.
    pub fn snapshot(&self) -> Result<Vec<ClipboardEntry>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Snapshot(reply_tx))?;
        Self::await_reply(reply_rx).context("Failed to read clipboard history")
    }

    fn await_reply<T>(reply_rx: Receiver<StorageResult<T>>) -> Result<T> {
        let reply = reply_rx
            .recv()
            .map_err(|_| anyhow!("history service stopped before replying"))?;
        Ok(reply?)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| anyhow!("history service is not running"))
    }
}

pub struct HistoryService {
    handle: HistoryHandle,
    worker: Option<thread::JoinHandle<ServiceStats>>,
}

impl HistoryService {
    pub fn spawn<S, C>(engine: HistoryEngine<S>, writer: C) -> Result<Self>
    where
        S: HistoryStore + Send + 'static,
        C: Clipboard + 'static,
    {
        let (tx, rx) = bounded::<Command>(QUEUE_CAPACITY);
        let worker = thread::Builder::new()
            .name("clipcapsule-history".to_string())
            .spawn(move || run_service(rx, engine, writer))
            .context("Failed to spawn history service thread")?;
        Ok(Self {
            handle: HistoryHandle { sender: tx },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> HistoryHandle {
        self.handle.clone()
    }

    /// Queues a shutdown behind in-flight commands and waits for the owner thread.
    pub fn shutdown(mut self) -> Result<ServiceStats> {
        self.stop()
    }

    fn stop(&mut self) -> Result<ServiceStats> {
        let Some(worker) = self.worker.take() else {
            return Ok(ServiceStats::default());
        };
        // A send error means the worker already exited; join reports why.
        let _ = self.handle.sender.send(Command::Shutdown);
        worker
            .join()
            .map_err(|_| anyhow!("history service thread panicked"))
    }
}

impl Drop for HistoryService {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("{err:#}");
        }
    }
}

fn run_service<S, C>(rx: Receiver<Command>, mut engine: HistoryEngine<S>, mut writer: C) -> ServiceStats
where
    S: HistoryStore,
    C: Clipboard,
{
    let mut stats = ServiceStats::default();
    for command in rx.iter() {
        match command {
            Command::NewClip(content) => handle_new_clip(&mut engine, &content, &mut stats),
            Command::Select(slot) => handle_select(&mut engine, &mut writer, slot, &mut stats),
            Command::Move { from, to, reply } => {
                let result = engine.move_entry(from, to);
                record_reorder(&result, &mut stats);
                reply.send(result).ok();
            }
            Command::Reorder { ordered, reply } => {
                let result = engine.reorder(&ordered);
                record_reorder(&result, &mut stats);
                reply.send(result).ok();
            }
            Command::Snapshot(reply) => {
                reply.send(engine.entries()).ok();
            }
            Command::Shutdown => break,
        }
    }
    info!(
        stored = stats.clips_stored,
        selections = stats.selections,
        storage_errors = stats.storage_errors,
        "history service stopped"
    );
    stats
}

fn handle_new_clip<S: HistoryStore>(engine: &mut HistoryEngine<S>, content: &str, stats: &mut ServiceStats) {
    match engine.on_new_clip(content) {
        Ok(ClipOutcome::Stored) => {
            stats.clips_stored += 1;
            info!(preview = %preview(content), "clipboard changed, stored new content");
        }
        Ok(ClipOutcome::AlreadyFront | ClipOutcome::Empty) => {
            stats.clips_skipped += 1;
        }
        Err(err) => {
            stats.storage_errors += 1;
            warn!(error = %err, "failed to store clipboard content");
        }
    }
}

fn record_reorder(result: &StorageResult<bool>, stats: &mut ServiceStats) {
    match result {
        Ok(true) => {
            stats.reorders += 1;
            info!("history reordered");
        }
        Ok(false) => {}
        Err(err) if err.is_not_found() || matches!(err, StorageError::InvalidList(_)) => {
            debug!(error = %err, "rejected reorder");
        }
        Err(err) => {
            stats.storage_errors += 1;
            warn!(error = %err, "failed to store reordered history");
        }
    }
}

fn handle_select<S: HistoryStore, C: Clipboard>(
    engine: &mut HistoryEngine<S>,
    writer: &mut C,
    slot: u8,
    stats: &mut ServiceStats,
) {
    let selected = match engine.on_select(slot) {
        Ok(Some(selected)) => selected,
        Ok(None) => {
            debug!(slot, "no item at slot");
            return;
        }
        Err(err) => {
            stats.storage_errors += 1;
            warn!(slot, error = %err, "failed to promote slot");
            return;
        }
    };
    stats.selections += 1;
    if let Err(err) = writer.write_text(&selected) {
        stats.clipboard_errors += 1;
        warn!(slot, error = %format!("{err:#}"), "failed to set clipboard");
        return;
    }
    info!(slot, preview = %preview(&selected), "recalled slot");
}

pub fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push('…');
    }
    out.replace(['\n', '\r'], " ")
}
