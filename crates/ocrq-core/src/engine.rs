//! The OCR collaborator seam.
//!
//! The recognition pipeline itself is out of scope; workers only see
//! [`OcrEngine::run_ocr`].  [`CommandEngine`] adapts any external program
//! that reads the file on stdin and prints `{"text": …, "confidence": …}`.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::OcrError;

/// Exit status a [`CommandEngine`] program uses to reject the file content
/// (`EX_DATAERR` from `sysexits.h`).
pub const EXIT_UNSUPPORTED_CONTENT: i32 = 65;

/// Raw collaborator output.  `text` is plain UTF-8; encoding happens when the
/// worker builds the [`crate::OcrResult`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub confidence: f64,
}

#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognise `file`.  `file_type` is the lower-case extension the upload
    /// was accepted under, e.g. `"pdf"`.
    async fn run_ocr(&self, file: Bytes, file_type: &str) -> Result<OcrOutput, OcrError>;
}

/// Runs an external program once per task.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line such as
    /// `"/usr/local/bin/ocr-cli --lang fas"`.  Returns `None` for a blank line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl OcrEngine for CommandEngine {
    async fn run_ocr(&self, file: Bytes, file_type: &str) -> Result<OcrOutput, OcrError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(file_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OcrError::Engine(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit without draining stdin; that surfaces
            // through its exit status, not as a write error.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&file).await {
                    debug!(error = %e, "ocr engine closed stdin early");
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OcrError::Engine(format!("failed to wait for {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(program = %self.program, status = %output.status, "ocr engine exited with failure");
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            };
            return Err(match output.status.code() {
                Some(EXIT_UNSUPPORTED_CONTENT) => OcrError::UnsupportedContent(message),
                _ => OcrError::Engine(message),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| OcrError::Engine(format!("invalid engine output: {e}")))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
