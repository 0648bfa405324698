//! File payload persistence
//!
//! Received messages that name a file are written under the incoming
//! directory instead of the clipboard. Name collisions get a numeric suffix.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::protocol::Message;

/// Writes received file payloads to disk.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default incoming directory under the platform data dir.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("clipmesh")
            .join("files")
    }

    /// Persist a message body, returning the path written.
    pub async fn write(&self, msg: &Message) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.unique_path(&msg.name).await;
        tokio::fs::write(&path, &msg.data).await?;
        debug!(id = %msg.id, path = %path.display(), bytes = msg.data.len(), "file payload written");
        Ok(path)
    }

    async fn unique_path(&self, name: &str) -> PathBuf {
        let base = sanitize(name);
        let mut candidate = self.dir.join(&base);
        let mut counter = 1u32;
        while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            candidate = self.dir.join(format!("{base}.{counter}"));
            counter += 1;
        }
        candidate
    }
}

/// Strip path separators so a peer cannot direct writes outside the store.
fn sanitize(name: &str) -> String {
    let trimmed = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if trimmed.is_empty() {
        "payload.bin".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdGenerator;

    #[tokio::test]
    async fn test_write_and_collision_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let g = IdGenerator::with_tag(9);

        let msg = Message::file(g.message_id(), b"abc".to_vec(), "text/plain", "note.txt");
        let p1 = store.write(&msg).await.unwrap();
        let p2 = store.write(&msg).await.unwrap();

        assert_eq!(p1.file_name().unwrap(), "note.txt");
        assert_eq!(p2.file_name().unwrap(), "note.txt.1");
        assert_eq!(tokio::fs::read(&p2).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_sanitize_blocks_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let g = IdGenerator::with_tag(9);

        let msg = Message::file(g.message_id(), b"x".to_vec(), "text/plain", "../../evil");
        let path = store.write(&msg).await.unwrap();
        assert!(path.starts_with(tmp.path()));
        assert_eq!(path.file_name().unwrap(), "evil");
    }
}
