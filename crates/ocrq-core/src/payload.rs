//! Upload storage.
//!
//! Each upload is written once, at submission, to
//! `<root>/<task_id>/<sanitized file name>`; the stored reference is the path
//! relative to `root`.  Workers only read it, and it is removed once the task
//! has reached a terminal state.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes` for `task_id` and return the payload reference.
    ///
    /// Fails if a payload already exists at that location.
    pub async fn put(&self, task_id: &str, filename: &str, bytes: &[u8]) -> Result<String, CoreError> {
        let payload_ref = format!("{}/{}", sanitize_filename(task_id), sanitize_filename(filename));
        let path = self.resolve(&payload_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        debug!(path = %path.display(), size_bytes = bytes.len(), "payload stored");
        Ok(payload_ref)
    }

    pub async fn get(&self, payload_ref: &str) -> Result<Bytes, CoreError> {
        let path = self.resolve(payload_ref)?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    /// Delete a payload and its per-task directory.  Missing files are not an
    /// error, so cleanup can be repeated after a redelivery.
    pub async fn remove(&self, payload_ref: &str) -> Result<(), CoreError> {
        let path = self.resolve(payload_ref)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent().filter(|p| *p != self.root) {
            // Only succeeds once the directory is empty.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    fn resolve(&self, payload_ref: &str) -> Result<PathBuf, CoreError> {
        let relative = Path::new(payload_ref);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoreError::Corrupt(format!(
                "payload reference escapes the payload root: {payload_ref}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

/// Sanitize a filename to prevent directory traversal.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_owned()
    } else {
        cleaned.to_owned()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
