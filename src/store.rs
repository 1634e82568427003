use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEntry {
    pub id: i64,
    pub content: String,
    pub position: i64,
}

/// Durable ordered list of clipboard texts.
///
/// Every mutation is a full replacement: implementations must make `replace_all`
/// atomic so a failed write leaves the previous list observable.
pub trait HistoryStore {
    fn replace_all(&mut self, ordered_contents: &[String]) -> StorageResult<()>;
    fn fetch_all_ordered(&self) -> StorageResult<Vec<ClipboardEntry>>;
    fn fetch_at_position(&self, position: i64) -> StorageResult<ClipboardEntry>;

    fn count(&self) -> StorageResult<usize> {
        Ok(self.fetch_all_ordered()?.len())
    }
}

pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        init_db(&mut conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens an existing database for inspection. No schema or pragma changes are made,
    /// and every write through this store fails.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        init_db(&mut conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn init_db(conn: &mut Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS clipboard_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            position INTEGER NOT NULL
        );
        ",
    )?;
    // Rows written without the index may share a position; the index cannot be built over them.
    let clashing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (
            SELECT position FROM clipboard_items GROUP BY position HAVING COUNT(*) > 1
        )",
        [],
        |row| row.get(0),
    )?;
    if clashing > 0 {
        renumber_positions(conn)?;
    }
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_clipboard_items_position ON clipboard_items(position);",
    )?;
    Ok(())
}

/// Reassigns positions 0..n-1 in stored order, ties broken by insertion id.
fn renumber_positions(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction()?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM clipboard_items ORDER BY position ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    {
        let mut stmt = tx.prepare("UPDATE clipboard_items SET position = ? WHERE id = ?")?;
        for (position, id) in ids.iter().enumerate() {
            stmt.execute(params![position as i64, id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Rejects lists that would break the stored invariants before any row is touched.
pub fn validate_list(ordered_contents: &[String]) -> StorageResult<()> {
    let mut seen = HashSet::with_capacity(ordered_contents.len());
    for (index, content) in ordered_contents.iter().enumerate() {
        if content.is_empty() {
            return Err(StorageError::InvalidList(format!("empty content at index {index}")));
        }
        if !seen.insert(content.as_str()) {
            return Err(StorageError::InvalidList(format!("duplicate content at index {index}")));
        }
    }
    Ok(())
}

impl HistoryStore for SqliteStore {
    fn replace_all(&mut self, ordered_contents: &[String]) -> StorageResult<()> {
        validate_list(ordered_contents)?;
        // Dropping the transaction without commit rolls back.
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM clipboard_items", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO clipboard_items (content, position) VALUES (?, ?)")?;
            for (position, content) in ordered_contents.iter().enumerate() {
                stmt.execute(params![content, position as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn fetch_all_ordered(&self) -> StorageResult<Vec<ClipboardEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, content, position FROM clipboard_items ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ClipboardEntry {
                id: row.get(0)?,
                content: row.get(1)?,
                position: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn fetch_at_position(&self, position: i64) -> StorageResult<ClipboardEntry> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, content, position FROM clipboard_items WHERE position = ? LIMIT 1")?;
        let entry = stmt
            .query_row(params![position], |row| {
                Ok(ClipboardEntry {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    position: row.get(2)?,
                })
            })
            .optional()?;
        entry.ok_or(StorageError::NotFound { position })
    }

    fn count(&self) -> StorageResult<usize> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM clipboard_items", [], |row| row.get(0))?;
        Ok(total as usize)
    }
}
