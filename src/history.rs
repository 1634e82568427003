//! Move-to-front history over a [`HistoryStore`].
//!
//! The engine computes each new list in memory and hands it to the store as a
//! whole. It never patches single rows, so a failed write simply discards the
//! computed list and the stored one stays authoritative.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::store::{ClipboardEntry, HistoryStore};

/// Number of hotkey-addressable slots.
pub const SLOT_COUNT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Trimmed,
}

impl MatchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(MatchMode::Exact),
            "trimmed" | "trim" => Some(MatchMode::Trimmed),
            _ => None,
        }
    }

    pub fn matches(self, left: &str, right: &str) -> bool {
        match self {
            MatchMode::Exact => left == right,
            MatchMode::Trimmed => left.trim() == right.trim(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipOutcome {
    Empty,
    AlreadyFront,
    Stored,
}

/// Returns `list` with `content` at the front and any matching entry removed.
pub fn promote(list: &[String], content: &str, mode: MatchMode) -> Vec<String> {
    let mut next = Vec::with_capacity(list.len() + 1);
    next.push(content.to_string());
    next.extend(
        list.iter()
            .filter(|existing| !mode.matches(existing, content))
            .cloned(),
    );
    next
}

/// Maps a 1-based hotkey slot to a 0-based position.
pub fn slot_position(slot: u8) -> Option<usize> {
    if (1..=SLOT_COUNT).contains(&slot) {
        Some(usize::from(slot - 1))
    } else {
        None
    }
}

pub struct HistoryEngine<S: HistoryStore> {
    store: S,
    match_mode: MatchMode,
}

impl<S: HistoryStore> HistoryEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_match_mode(store, MatchMode::Exact)
    }

    pub fn with_match_mode(store: S, match_mode: MatchMode) -> Self {
        Self { store, match_mode }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn entries(&self) -> StorageResult<Vec<ClipboardEntry>> {
        self.store.fetch_all_ordered()
    }

    fn contents(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .store
            .fetch_all_ordered()?
            .into_iter()
            .map(|entry| entry.content)
            .collect())
    }

    pub fn on_new_clip(&mut self, content: &str) -> StorageResult<ClipOutcome> {
        if content.is_empty() {
            return Ok(ClipOutcome::Empty);
        }
        let current = self.contents()?;
        if let Some(front) = current.first() {
            if front == content {
                debug!("content already at top position, no update needed");
                return Ok(ClipOutcome::AlreadyFront);
            }
        }
        let next = promote(&current, content, self.match_mode);
        self.store.replace_all(&next)?;
        debug!(len = next.len(), "stored new clip");
        Ok(ClipOutcome::Stored)
    }

    pub fn on_select(&mut self, slot: u8) -> StorageResult<Option<String>> {
        let Some(position) = slot_position(slot) else {
            debug!(slot, "slot outside hotkey range");
            return Ok(None);
        };
        let current = self.contents()?;
        let Some(selected) = current.get(position).cloned() else {
            debug!(slot, len = current.len(), "no item at slot");
            return Ok(None);
        };
        if position != 0 {
            let next = promote(&current, &selected, MatchMode::Exact);
            self.store.replace_all(&next)?;
        }
        Ok(Some(selected))
    }

    /// Replaces the order of the whole list. `ordered` must hold exactly the stored
    /// contents; returns whether the order changed.
    pub fn reorder(&mut self, ordered: &[String]) -> StorageResult<bool> {
        let current = self.contents()?;
        if ordered.len() != current.len() {
            return Err(StorageError::InvalidList(format!(
                "reorder has {} entries, history has {}",
                ordered.len(),
                current.len()
            )));
        }
        let stored: HashSet<&str> = current.iter().map(String::as_str).collect();
        if let Some(unknown) = ordered.iter().position(|content| !stored.contains(content.as_str())) {
            return Err(StorageError::InvalidList(format!(
                "entry at index {unknown} is not in the history"
            )));
        }
        let distinct: HashSet<&str> = ordered.iter().map(String::as_str).collect();
        if distinct.len() != ordered.len() {
            return Err(StorageError::InvalidList("reorder repeats an entry".to_string()));
        }
        if ordered == current.as_slice() {
            return Ok(false);
        }
        self.store.replace_all(ordered)?;
        debug!(len = ordered.len(), "reordered history");
        Ok(true)
    }

    /// Moves the entry at position `from` to position `to`, shifting the rest.
    pub fn move_entry(&mut self, from: usize, to: usize) -> StorageResult<bool> {
        let mut next = self.contents()?;
        for position in [from, to] {
            if position >= next.len() {
                return Err(StorageError::NotFound {
                    position: position as i64,
                });
            }
        }
        let moved = next.remove(from);
        next.insert(to, moved);
        self.reorder(&next)
    }

    /// Rewrites the stored list when it breaks an invariant. Returns whether a rewrite happened.
    pub fn normalize(&mut self) -> StorageResult<bool> {
        let entries = self.store.fetch_all_ordered()?;
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(index, entry)| entry.position == index as i64);

        let mut seen = HashSet::with_capacity(entries.len());
        let mut cleaned = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.content.is_empty() {
                continue;
            }
            if seen.insert(entry.content.clone()) {
                cleaned.push(entry.content.clone());
            }
        }

        if contiguous && cleaned.len() == entries.len() {
            return Ok(false);
        }
        info!(
            before = entries.len(),
            after = cleaned.len(),
            "repairing stored clipboard history"
        );
        self.store.replace_all(&cleaned)?;
        Ok(true)
    }
}
