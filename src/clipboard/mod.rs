//! Clipboard abstraction
//!
//! The protocol engine treats the clipboard purely as a byte source/sink
//! behind [`ClipboardProvider`]. The system provider rides `arboard`; the
//! in-memory provider backs tests and headless operation.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Maximum clipboard content size accepted from the platform (5MB)
pub const MAX_CLIPBOARD_SIZE: usize = 5 * 1024 * 1024;

/// Clipboard operation errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Reading the platform clipboard failed
    #[error("clipboard read failed: {0}")]
    Read(String),

    /// Writing the platform clipboard failed
    #[error("clipboard write failed: {0}")]
    Write(String),

    /// No clipboard is available in this environment
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),

    /// Content exceeds [`MAX_CLIPBOARD_SIZE`]
    #[error("content of {0} bytes exceeds the clipboard size limit")]
    TooLarge(usize),
}

/// Platform-agnostic clipboard interface.
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Read the current clipboard content.
    async fn get(&self) -> Result<Vec<u8>, ClipboardError>;

    /// Replace the clipboard content.
    async fn set(&self, data: &[u8]) -> Result<(), ClipboardError>;

    /// Provider name, advertised in the handshake.
    fn name(&self) -> &'static str;
}

/// System clipboard via `arboard`. Text only; arboard handles the platform
/// specifics. Calls run on the blocking pool because platform clipboards are
/// synchronous.
pub struct SystemClipboard;

impl SystemClipboard {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn get(&self) -> Result<Vec<u8>, ClipboardError> {
        let text = tokio::task::spawn_blocking(|| {
            let mut clipboard =
                arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
            clipboard
                .get_text()
                .map_err(|e| ClipboardError::Read(e.to_string()))
        })
        .await
        .map_err(|e| ClipboardError::Read(e.to_string()))??;

        let data = text.into_bytes();
        if data.len() > MAX_CLIPBOARD_SIZE {
            return Err(ClipboardError::TooLarge(data.len()));
        }
        Ok(data)
    }

    async fn set(&self, data: &[u8]) -> Result<(), ClipboardError> {
        if data.len() > MAX_CLIPBOARD_SIZE {
            return Err(ClipboardError::TooLarge(data.len()));
        }
        let text = String::from_utf8_lossy(data).into_owned();
        tokio::task::spawn_blocking(move || {
            let mut clipboard =
                arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
            clipboard
                .set_text(text)
                .map_err(|e| ClipboardError::Write(e.to_string()))
        })
        .await
        .map_err(|e| ClipboardError::Write(e.to_string()))?
    }

    fn name(&self) -> &'static str {
        "arboard"
    }
}

/// In-memory clipboard for tests and headless nodes.
#[derive(Default)]
pub struct MemoryClipboard {
    content: RwLock<Vec<u8>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the clipboard with initial content.
    pub fn with_content(data: &[u8]) -> Self {
        Self {
            content: RwLock::new(data.to_vec()),
        }
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn get(&self) -> Result<Vec<u8>, ClipboardError> {
        Ok(self.content.read().await.clone())
    }

    async fn set(&self, data: &[u8]) -> Result<(), ClipboardError> {
        if data.len() > MAX_CLIPBOARD_SIZE {
            return Err(ClipboardError::TooLarge(data.len()));
        }
        *self.content.write().await = data.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
