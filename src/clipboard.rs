use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

/// System clipboard capability, text format only.
pub trait Clipboard: Send {
    /// `Ok(None)` when the clipboard holds no text.
    fn read_text(&mut self) -> Result<Option<String>>;
    fn write_text(&mut self, text: &str) -> Result<()>;
}

/// Turns raw clipboard observations into new-clip events.
///
/// Drops empty text and text equal to the previous observation, which also
/// swallows the echo of our own writes after a slot is recalled.
#[derive(Debug, Default)]
pub struct ClipboardEventSource {
    last_observed: Option<String>,
}

impl ClipboardEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, content: &str) -> Option<String> {
        if content.is_empty() {
            return None;
        }
        if self.last_observed.as_deref() == Some(content) {
            return None;
        }
        self.last_observed = Some(content.to_string());
        Some(content.to_string())
    }

    pub fn last_observed(&self) -> Option<&str> {
        self.last_observed.as_deref()
    }
}

/// In-process clipboard shared between clones; used for headless runs and tests.
#[derive(Clone, Default)]
pub struct MemoryClipboard {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    text: Option<String>,
    writes: Vec<String>,
    fail_writes: bool,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, text: &str) {
        if let Ok(mut state) = self.inner.lock() {
            state.text = Some(text.to_string());
        }
    }

    pub fn current(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|state| state.text.clone())
    }

    /// Texts written through [`Clipboard::write_text`], oldest first.
    pub fn writes(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|state| state.writes.clone())
            .unwrap_or_default()
    }

    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_writes = fail;
        }
    }
}

impl Clipboard for MemoryClipboard {
    fn read_text(&mut self) -> Result<Option<String>> {
        let state = self.inner.lock().map_err(|_| anyhow!("clipboard lock poisoned"))?;
        Ok(state.text.clone())
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        let mut state = self.inner.lock().map_err(|_| anyhow!("clipboard lock poisoned"))?;
        if state.fail_writes {
            anyhow::bail!("clipboard unavailable");
        }
        state.text = Some(text.to_string());
        state.writes.push(text.to_string());
        Ok(())
    }
}

#[cfg(feature = "arboard")]
pub use self::system::SystemClipboard;

#[cfg(feature = "arboard")]
mod system {
    use anyhow::{Context, Result};

    use super::Clipboard;

    pub struct SystemClipboard {
        inner: arboard::Clipboard,
    }

    impl SystemClipboard {
        pub fn new() -> Result<Self> {
            let inner = arboard::Clipboard::new().context("Failed to open system clipboard")?;
            Ok(Self { inner })
        }
    }

    impl Clipboard for SystemClipboard {
        fn read_text(&mut self) -> Result<Option<String>> {
            match self.inner.get_text() {
                Ok(text) => Ok(Some(text)),
                Err(arboard::Error::ContentNotAvailable) => Ok(None),
                Err(err) => Err(err).context("Failed to read clipboard text"),
            }
        }

        fn write_text(&mut self, text: &str) -> Result<()> {
            self.inner
                .set_text(text.to_string())
                .context("Failed to write clipboard text")
        }
    }
}
