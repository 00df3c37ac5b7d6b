use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::Db;

/// One read from the tail position: whole lines only, in file order.
/// `reset` marks a discontinuity — the source shrank below the stored
/// offset (rotation/truncation) and reading restarted from byte 0, so
/// downstream state built from earlier lines is stale.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub lines: Vec<String>,
    pub reset: bool,
}

/// Follows a growing log file from a byte offset that survives process
/// restart. The offset only ever advances past complete lines, so no line
/// is split or skipped across polls or restarts; a trailing partial line
/// is re-read once its newline arrives.
pub struct Tailer {
    path: String,
    db: Arc<Db>,
    poll_interval: Duration,
    offset: u64,
}

impl Tailer {
    pub fn new(path: impl Into<String>, db: Arc<Db>, poll_interval_ms: u64) -> Self {
        let path = path.into();
        let offset = db.get_tail_offset(&path);
        Self {
            path,
            db,
            poll_interval: Duration::from_millis(poll_interval_ms),
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Poll until the receiver side goes away. Sending into the bounded
    /// channel blocks when the consumer is behind, which pauses polling
    /// instead of buffering the stream (backpressure per the engine's
    /// resource model).
    pub async fn run(mut self, tx: mpsc::Sender<LogBatch>) {
        info!(path = %self.path, offset = self.offset, "tailer started");
        loop {
            match self.poll_once().await {
                Ok(Some(batch)) => {
                    if tx.send(batch).await.is_err() {
                        info!(path = %self.path, "tail consumer dropped, stopping");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(path = %self.path, "tail poll error: {e}"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Single poll step. `None` means nothing new and no discontinuity.
    pub async fn poll_once(&mut self) -> Result<Option<LogBatch>> {
        let Ok(meta) = tokio::fs::metadata(&self.path).await else {
            // Source missing is not an error; it may appear later.
            return Ok(None);
        };
        let size = meta.len();

        let mut reset = false;
        if size < self.offset {
            warn!(
                path = %self.path,
                offset = self.offset,
                size,
                "log source truncated, resuming from start"
            );
            self.offset = 0;
            self.db.set_tail_offset(&self.path, 0)?;
            reset = true;
        }

        if size == self.offset {
            return Ok(reset.then(|| LogBatch { lines: vec![], reset: true }));
        }

        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("open log source {}", self.path))?;
        file.seek(SeekFrom::Start(self.offset))
            .await
            .context("seek to tail offset")?;

        let mut buf = Vec::with_capacity((size - self.offset) as usize);
        file.take(size - self.offset)
            .read_to_end(&mut buf)
            .await
            .context("read new log content")?;

        // Advance only past the last complete line; a trailing fragment is
        // left for the next poll.
        let Some(last_nl) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(reset.then(|| LogBatch { lines: vec![], reset: true }));
        };

        let complete = &buf[..=last_nl];
        let lines: Vec<String> = String::from_utf8_lossy(complete)
            .split('\n')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        self.offset += (last_nl + 1) as u64;
        self.db.set_tail_offset(&self.path, self.offset)?;

        Ok(Some(LogBatch { lines, reset }))
    }
}
