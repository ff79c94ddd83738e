//! JSONL audit sink for `portcullis`. Writes one event per line.
//! Always appends; bring your own path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use portcullis::{AuditError, AuditEvent, AuditSink};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    // serializes appends so concurrent records never interleave within a line
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(&event).map_err(|e| AuditError(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditError(format!("{}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes()).await.map_err(|e| AuditError(e.to_string()))?;
        file.flush().await.map_err(|e| AuditError(e.to_string()))?;
        tracing::trace!(target: "portcullis::audit", path = %self.path.display(), action = %event.action, "audit line appended");
        Ok(())
    }
}
