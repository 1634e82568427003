//! Clipboard history with Ctrl+Shift+1..9 recall.
//!
//! Two event sources feed one serialized mutation point:
//!
//! ```text
//! clipboard watch ──┐
//!                   ├──> HistoryService (owner thread) ──> HistoryEngine ──> SqliteStore
//! keyboard chords ──┘                         │
//!                                             └──> Clipboard::write_text (after commit)
//! ```

pub mod clipboard;
pub mod config;
pub mod daemon;
pub mod error;
pub mod history;
pub mod keys;
pub mod logging;
pub mod service;
pub mod store;

pub use clipboard::{Clipboard, ClipboardEventSource, MemoryClipboard};
pub use config::Config;
pub use error::{StorageError, StorageResult};
pub use history::{ClipOutcome, HistoryEngine, MatchMode, SLOT_COUNT};
pub use keys::{ChordDetector, ChordEvent, Key, KeyboardDevice, KeyboardState, Transition};
pub use service::{HistoryHandle, HistoryService, ServiceStats};
pub use store::{ClipboardEntry, HistoryStore, SqliteStore};
