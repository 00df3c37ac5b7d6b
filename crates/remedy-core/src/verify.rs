use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::extractor::{CandidateError, Extractor};
use crate::service::ServiceControl;
use crate::types::{normalize_message, signature_of, DetectedError, FixOutcome};

/// Structured verification result. Rejected fixes carry the reason; any
/// fresh error signatures observed during the window come back so the
/// caller can feed them into the pipeline as new incidents instead of
/// losing them.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub accepted: bool,
    pub syntax_ok: bool,
    pub original_recurred: bool,
    pub new_candidates: Vec<CandidateError>,
    pub detail: String,
    pub duration_s: f64,
}

impl Verdict {
    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            syntax_ok: true,
            original_recurred: false,
            new_candidates: Vec::new(),
            detail: detail.into(),
            duration_s: 0.0,
        }
    }
}

#[async_trait]
pub trait FixVerifier: Send + Sync {
    async fn verify(&self, error: &DetectedError, outcome: &FixOutcome) -> Result<Verdict>;
}

/// Verifies a fix against the live service: syntax check first (the cheap
/// rejection path), then restart-if-required, then a stabilization window
/// over fresh log output watching for the original signature or anything
/// new.
pub struct LogVerifier {
    log_file: String,
    syntax_check_cmd: String,
    context_lines: usize,
    stabilization: Duration,
    ready_timeout: Duration,
    service: Arc<dyn ServiceControl>,
    /// Shared with the engine and updater; only one operation may hold the
    /// service stopped at a time.
    restart_lock: Arc<Mutex<()>>,
}

impl LogVerifier {
    pub fn new(
        log_file: impl Into<String>,
        syntax_check_cmd: impl Into<String>,
        context_lines: usize,
        stabilization: Duration,
        ready_timeout: Duration,
        service: Arc<dyn ServiceControl>,
        restart_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            log_file: log_file.into(),
            syntax_check_cmd: syntax_check_cmd.into(),
            context_lines,
            stabilization,
            ready_timeout,
            service,
            restart_lock,
        }
    }

    async fn check_syntax(&self, file: &str) -> Result<bool> {
        let cmd = self.syntax_check_cmd.replace("{file}", file);
        let output = Command::new("sh")
            .args(["-c", cmd.as_str()])
            .output()
            .await
            .with_context(|| format!("syntax check: {cmd}"))?;
        Ok(output.status.success())
    }

    /// Bytes appended to the log since `watermark`. A shrink below the
    /// watermark means rotation; read the whole file in that case.
    async fn read_since(&self, watermark: u64) -> Result<String> {
        let Ok(meta) = tokio::fs::metadata(&self.log_file).await else {
            return Ok(String::new());
        };
        let from = if meta.len() < watermark { 0 } else { watermark };
        let mut file = tokio::fs::File::open(&self.log_file)
            .await
            .with_context(|| format!("open log {}", self.log_file))?;
        file.seek(SeekFrom::Start(from)).await.context("seek log watermark")?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.context("read log tail")?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn log_size(&self) -> u64 {
        tokio::fs::metadata(&self.log_file)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FixVerifier for LogVerifier {
    async fn verify(&self, error: &DetectedError, outcome: &FixOutcome) -> Result<Verdict> {
        let started = std::time::Instant::now();

        // 1. Syntax-check the modified files; fastest rejection path.
        for file in &outcome.files_modified {
            if !file.ends_with(".py") {
                continue;
            }
            match self.check_syntax(file).await {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(Verdict {
                        syntax_ok: false,
                        detail: format!("syntax check failed for {file}"),
                        duration_s: started.elapsed().as_secs_f64(),
                        ..Verdict::rejected("")
                    });
                }
                Err(e) => {
                    warn!(file, "syntax check did not run: {e}");
                }
            }
        }

        // Only log output produced after this point counts.
        let watermark = self.log_size().await;

        // 2. Restart under the global lock when the fix needs it.
        if error.requires_restart {
            let _guard = self.restart_lock.lock().await;
            if let Err(e) = self.service.stop().await {
                return Ok(Verdict {
                    detail: format!("service stop failed: {e}"),
                    duration_s: started.elapsed().as_secs_f64(),
                    ..Verdict::rejected("")
                });
            }
            if let Err(e) = self.service.start().await {
                return Ok(Verdict {
                    detail: format!("service start failed: {e}"),
                    duration_s: started.elapsed().as_secs_f64(),
                    ..Verdict::rejected("")
                });
            }
            if !self.service.await_ready(self.ready_timeout).await {
                warn!(error_id = %error.id, "service not ready after restart, observing logs anyway");
            }
        }

        // 3. Stabilization window, then scan everything that arrived.
        tokio::time::sleep(self.stabilization).await;
        let fresh = self.read_since(watermark).await?;
        let candidates = Extractor::scan(&fresh, self.context_lines);

        let original_signature = error.signature();
        let mut original_recurred = false;
        let mut new_candidates = Vec::new();
        for candidate in candidates {
            let signature = signature_of(
                &candidate.error_type,
                candidate.file_path.as_deref(),
                candidate.line_number,
                &normalize_message(&candidate.message),
            );
            if signature == original_signature {
                original_recurred = true;
            } else {
                new_candidates.push(candidate);
            }
        }

        let accepted = !original_recurred && new_candidates.is_empty();
        let detail = if accepted {
            String::new()
        } else if original_recurred {
            "original error recurred during observation window".to_string()
        } else {
            format!(
                "{} new error(s) appeared during observation window",
                new_candidates.len()
            )
        };

        info!(
            error_id = %error.id,
            accepted,
            original_recurred,
            new_errors = new_candidates.len(),
            "fix verification finished"
        );

        Ok(Verdict {
            accepted,
            syntax_ok: true,
            original_recurred,
            new_candidates,
            detail,
            duration_s: started.elapsed().as_secs_f64(),
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
