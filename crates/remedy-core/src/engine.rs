use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    agent::FixBackend,
    backup::BackupManager,
    classify::classify,
    config::Config,
    db::Db,
    extractor::CandidateError,
    types::{
        normalize_message, AttemptStatus, DetectedError, EngineEvent, ErrorStatus, FixContext,
        FixOutcome, RetryPolicy, Snapshot,
    },
    verify::{FixVerifier, Verdict},
};

/// Owns the per-incident remediation lifecycle: dedup and admission,
/// bounded concurrent dispatch, the snapshot → fix → verify protocol,
/// backoff scheduling, escalation, and the manual retry/ignore triggers.
///
/// At most one attempt is in flight per incident (the in-flight set guards
/// the `queued|waiting → fixing` transition), and at most
/// `max_concurrent_fixes` incidents are being worked at once.
pub struct RemediationEngine {
    pub db: Arc<Db>,
    pub backend: Arc<dyn FixBackend>,
    pub verifier: Arc<dyn FixVerifier>,
    pub backup: Arc<BackupManager>,
    pub config: Arc<Config>,
    pub event_tx: broadcast::Sender<EngineEvent>,
    /// Serializes service stop/start across fix attempts and module
    /// updates. Shared with the verifier and updater.
    pub restart_lock: Arc<Mutex<()>>,
    policy: RetryPolicy,
    in_flight: Mutex<HashSet<String>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl RemediationEngine {
    pub fn new(
        db: Arc<Db>,
        backend: Arc<dyn FixBackend>,
        verifier: Arc<dyn FixVerifier>,
        backup: Arc<BackupManager>,
        config: Arc<Config>,
        restart_lock: Arc<Mutex<()>>,
    ) -> (Arc<Self>, broadcast::Receiver<EngineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let policy = config.retry_policy();
        let engine = Arc::new(Self {
            db,
            backend,
            verifier,
            backup,
            config,
            event_tx: tx,
            restart_lock,
            policy,
            in_flight: Mutex::new(HashSet::new()),
            cancellations: Mutex::new(HashMap::new()),
        });
        (engine, rx)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    pub async fn active_fix_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    // ── Startup recovery ──────────────────────────────────────────────────

    /// Repair state left by a process that died mid-attempt: the
    /// in-progress attempt is failed (it already consumed its number) and
    /// the incident resumes from `waiting` — or escalates if that attempt
    /// was its last.
    pub fn recover(&self) -> Result<()> {
        let interrupted = self.db.fail_interrupted_attempts()?;
        for id in interrupted {
            let Some(err) = self.db.get_error(&id)? else { continue };
            if err.status != ErrorStatus::Fixing {
                continue;
            }
            let attempts = self.db.count_attempts(&id)?;
            if attempts >= err.max_attempts {
                self.db.update_error_status(&id, ErrorStatus::Escalated)?;
                warn!(error_id = %id, attempts, "interrupted incident escalated on recovery");
            } else {
                self.db.update_error_status(&id, ErrorStatus::Waiting)?;
                info!(error_id = %id, attempts, "interrupted incident requeued on recovery");
            }
        }
        Ok(())
    }

    // ── Admission ─────────────────────────────────────────────────────────

    /// Classify a candidate and either absorb it into an open incident with
    /// the same dedup signature or create a new one. Returns the new
    /// incident id, or `None` for an absorbed duplicate.
    pub fn admit(&self, candidate: CandidateError) -> Result<Option<String>> {
        let normalized = normalize_message(&candidate.message);

        if let Some(open) = self.db.find_open_by_signature(
            &candidate.error_type,
            candidate.file_path.as_deref(),
            candidate.line_number,
            &normalized,
        )? {
            self.db.touch_sighting(&open.id)?;
            debug!(
                error_id = %open.id,
                error_type = %candidate.error_type,
                "duplicate sighting absorbed into open incident"
            );
            return Ok(None);
        }

        let class = classify(&candidate.error_type);
        let status = if class.auto_fixable {
            ErrorStatus::Queued
        } else {
            ErrorStatus::NeedsManualReview
        };

        let now = Utc::now();
        let error = DetectedError {
            id: uuid::Uuid::new_v4().to_string(),
            error_type: candidate.error_type,
            message: candidate.message,
            normalized_message: normalized,
            stack_trace: candidate.stack_trace,
            module_name: candidate.module_name,
            file_path: candidate.file_path,
            line_number: candidate.line_number,
            context_before: candidate.context_before,
            context_after: candidate.context_after,
            severity: class.severity,
            category: class.category,
            auto_fixable: class.auto_fixable,
            requires_restart: class.requires_restart,
            status,
            occurrences: 1,
            max_attempts: self.policy.max_attempts,
            detected_at: now,
            last_seen_at: now,
            resolved_at: None,
        };
        self.db.insert_error(&error).context("admit: insert")?;

        info!(
            error_id = %error.id,
            error_type = %error.error_type,
            severity = error.severity.as_str(),
            module = error.module_name.as_deref().unwrap_or("-"),
            auto_fixable = error.auto_fixable,
            "error detected"
        );

        self.emit(EngineEvent::Detected {
            error_id: error.id.clone(),
            error_type: error.error_type.clone(),
            severity: error.severity,
        });
        match status {
            ErrorStatus::Queued => self.emit(EngineEvent::Queued {
                error_id: error.id.clone(),
            }),
            _ => self.emit(EngineEvent::NeedsManualReview {
                error_id: error.id.clone(),
            }),
        }

        Ok(Some(error.id))
    }

    // ── Dispatch ──────────────────────────────────────────────────────────

    /// One scheduler pass: spawn attempts for every incident whose backoff
    /// delay has elapsed, up to the concurrency limit.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let ready = self.db.list_dispatchable().context("list_dispatchable")?;
        for err in ready {
            let mut guard = self.in_flight.lock().await;
            if guard.len() >= self.config.max_concurrent_fixes {
                break;
            }
            if guard.contains(&err.id) {
                continue;
            }
            if !self.ready_for_attempt(&err)? {
                continue;
            }
            guard.insert(err.id.clone());
            drop(guard);

            let engine = Arc::clone(self);
            let id = err.id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.process_one(&id).await {
                    error!(error_id = %id, "fix attempt error: {e}");
                }
                engine.in_flight.lock().await.remove(&id);
                engine.cancellations.lock().await.remove(&id);
            });
        }
        Ok(())
    }

    /// Backoff gate: attempt k waits delay(k) after the previous attempt
    /// completed; attempt 1 runs immediately.
    pub fn ready_for_attempt(&self, error: &DetectedError) -> Result<bool> {
        let attempts = self.db.count_attempts(&error.id)?;
        if attempts >= error.max_attempts {
            return Ok(false);
        }
        let delay = self.policy.delay_before(attempts + 1);
        if delay == 0 {
            return Ok(true);
        }
        match self.db.last_attempt(&error.id)? {
            Some(last) => {
                let completed = last.completed_at.unwrap_or(last.invoked_at);
                Ok(Utc::now() >= completed + chrono::Duration::seconds(delay as i64))
            }
            None => Ok(true),
        }
    }

    // ── Per-attempt protocol ──────────────────────────────────────────────

    /// Run one attempt for an incident: snapshot, invoke, verify, record.
    pub async fn process_one(&self, id: &str) -> Result<()> {
        let result = self.run_attempt(id).await;
        self.cancellations.lock().await.remove(id);
        result
    }

    async fn run_attempt(&self, id: &str) -> Result<()> {
        let Some(error) = self.db.get_error(id)? else {
            return Ok(());
        };
        // Transition guard: only queued|waiting may enter fixing.
        if !matches!(error.status, ErrorStatus::Queued | ErrorStatus::Waiting) {
            return Ok(());
        }

        let attempts = self.db.count_attempts(id)?;
        if attempts >= error.max_attempts {
            self.escalate(&error, attempts)?;
            return Ok(());
        }
        let attempt_number = attempts + 1;

        // The attempt row is persisted before the backend runs so a crash
        // mid-fix cannot reuse this number.
        let attempt_id = self.db.insert_attempt(id, attempt_number)?;
        self.db.update_error_status(id, ErrorStatus::Fixing)?;
        self.emit(EngineEvent::Fixing {
            error_id: id.to_string(),
            attempt: attempt_number,
        });
        info!(
            error_id = %id,
            error_type = %error.error_type,
            attempt = attempt_number,
            max_attempts = error.max_attempts,
            "fix attempt started"
        );

        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(id.to_string(), cancel.clone());

        let started = std::time::Instant::now();

        let snapshots = match self.take_snapshots(&error).await {
            Ok(s) => s,
            Err(e) => {
                // Snapshot failure blocks the mutation entirely; the
                // incident needs an operator, not a retry.
                let reason = format!("snapshot failed: {e}");
                self.db.finalize_attempt(
                    attempt_id,
                    AttemptStatus::Failed,
                    &[],
                    Some(&reason),
                    started.elapsed().as_secs_f64(),
                )?;
                self.db.update_error_status(id, ErrorStatus::NeedsManualReview)?;
                error!(error_id = %id, "{reason}");
                self.emit(EngineEvent::SnapshotFailed {
                    error_id: id.to_string(),
                    reason,
                });
                self.emit(EngineEvent::NeedsManualReview {
                    error_id: id.to_string(),
                });
                return Ok(());
            }
        };

        let ctx = FixContext {
            workspace: self.workspace_for(&error),
            model: self.config.model.clone(),
            allowed_tools: self.config.agent_allowed_tools.clone(),
            max_turns: self.config.agent_max_turns,
            timeout_s: self.config.agent_timeout_s,
        };

        let outcome = tokio::select! {
            result = self.backend.run_fix(&error, &ctx) => match result {
                Ok(outcome) => outcome,
                Err(e) => FixOutcome::failed(format!("fix backend error: {e}")),
            },
            () = cancel.cancelled() => {
                // Manual ignore while the agent runs: stop waiting, roll
                // back any snapshot, go terminal without verification.
                self.rollback_all(&snapshots).await;
                self.release_snapshots(&snapshots);
                self.db.finalize_attempt(
                    attempt_id,
                    AttemptStatus::Failed,
                    &[],
                    Some("cancelled: incident ignored"),
                    started.elapsed().as_secs_f64(),
                )?;
                self.db.update_error_status(id, ErrorStatus::Ignored)?;
                info!(error_id = %id, attempt = attempt_number, "fix attempt cancelled by ignore");
                self.emit(EngineEvent::Ignored { error_id: id.to_string() });
                return Ok(());
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        if !outcome.success {
            let status = if outcome.timed_out {
                AttemptStatus::Timeout
            } else {
                AttemptStatus::Failed
            };
            let reason = outcome
                .failure_reason
                .clone()
                .unwrap_or_else(|| "fix agent reported failure".to_string());
            self.db.finalize_attempt(
                attempt_id,
                status,
                &outcome.files_modified,
                Some(&reason),
                elapsed,
            )?;
            self.release_snapshots(&snapshots);
            self.fail_or_retry(&error, attempt_number, &reason)?;
            return Ok(());
        }

        let verdict = match self.verifier.verify(&error, &outcome).await {
            Ok(v) => v,
            Err(e) => Verdict::rejected(format!("verification error: {e}")),
        };

        if verdict.accepted {
            self.db.finalize_attempt(
                attempt_id,
                AttemptStatus::Success,
                &outcome.files_modified,
                None,
                elapsed,
            )?;
            self.db.update_error_status(id, ErrorStatus::Resolved)?;
            self.release_snapshots(&snapshots);
            info!(
                error_id = %id,
                attempt = attempt_number,
                files = outcome.files_modified.len(),
                "fix verified, incident resolved"
            );
            self.emit(EngineEvent::Resolved {
                error_id: id.to_string(),
                attempt: attempt_number,
            });
        } else {
            self.rollback_all(&snapshots).await;
            self.release_snapshots(&snapshots);
            self.db.finalize_attempt(
                attempt_id,
                AttemptStatus::Failed,
                &outcome.files_modified,
                Some(&verdict.detail),
                elapsed,
            )?;
            self.fail_or_retry(&error, attempt_number, &verdict.detail)?;
        }

        // A fix that broke something else produced fresh incidents; they
        // enter the pipeline like any other detection.
        for candidate in verdict.new_candidates {
            if let Err(e) = self.admit(candidate) {
                warn!(error_id = %id, "could not admit verifier finding: {e}");
            }
        }

        Ok(())
    }

    /// Record the failed attempt outcome: back off for another try, or
    /// escalate when this was the last allowed attempt.
    fn fail_or_retry(&self, error: &DetectedError, attempt_number: i64, reason: &str) -> Result<()> {
        warn!(
            error_id = %error.id,
            attempt = attempt_number,
            max_attempts = error.max_attempts,
            "fix attempt failed: {reason}"
        );
        self.emit(EngineEvent::FixFailed {
            error_id: error.id.clone(),
            attempt: attempt_number,
            reason: reason.to_string(),
        });
        if attempt_number >= error.max_attempts {
            self.escalate(error, attempt_number)
        } else {
            self.db.update_error_status(&error.id, ErrorStatus::Waiting)
        }
    }

    fn escalate(&self, error: &DetectedError, attempts: i64) -> Result<()> {
        self.db.update_error_status(&error.id, ErrorStatus::Escalated)?;
        warn!(
            error_id = %error.id,
            error_type = %error.error_type,
            attempts,
            "retries exhausted, incident escalated"
        );
        self.emit(EngineEvent::Escalated {
            error_id: error.id.clone(),
            attempts,
        });
        Ok(())
    }

    // ── Snapshots around a fix ────────────────────────────────────────────

    /// Database snapshot when the fix will restart the service; fix-target
    /// snapshot of the module directory whenever one is resolvable.
    async fn take_snapshots(&self, error: &DetectedError) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        if error.requires_restart {
            let snapshot = self.backup.snapshot_database().await?;
            self.db.set_snapshot_in_use(&snapshot.id, true)?;
            snapshots.push(snapshot);
        }
        if let Some(target) = self.fix_target_dir(error) {
            match self.backup.snapshot_files(&target).await {
                Ok(snapshot) => {
                    self.db.set_snapshot_in_use(&snapshot.id, true)?;
                    snapshots.push(snapshot);
                }
                Err(e) => {
                    // Don't strand the database snapshot outside retention.
                    self.release_snapshots(&snapshots);
                    return Err(e);
                }
            }
        }
        Ok(snapshots)
    }

    async fn rollback_all(&self, snapshots: &[Snapshot]) {
        // Restore newest-first: files before the database dump they
        // accompany.
        for snapshot in snapshots.iter().rev() {
            if let Err(e) = self.backup.restore(snapshot).await {
                error!(snapshot_id = %snapshot.id, "rollback failed: {e}");
            }
        }
    }

    fn release_snapshots(&self, snapshots: &[Snapshot]) {
        for snapshot in snapshots {
            if let Err(e) = self.db.set_snapshot_in_use(&snapshot.id, false) {
                warn!(snapshot_id = %snapshot.id, "release failed: {e}");
            }
        }
    }

    /// The directory the fix will mutate: the addon module the traceback
    /// points into, when it exists on disk.
    fn fix_target_dir(&self, error: &DetectedError) -> Option<String> {
        let file = error.file_path.as_deref()?;
        let mut dir = Path::new(file).parent()?;
        loop {
            if dir.join("__manifest__.py").exists() {
                return Some(dir.to_string_lossy().to_string());
            }
            dir = dir.parent()?;
        }
    }

    /// Workspace handed to the agent: the directory containing the module,
    /// falling back to the configured addons root.
    fn workspace_for(&self, error: &DetectedError) -> String {
        if let Some(target) = self.fix_target_dir(error) {
            if let Some(parent) = Path::new(&target).parent() {
                return parent.to_string_lossy().to_string();
            }
        }
        self.config.workspace_dir.clone()
    }

    // ── Manual triggers ───────────────────────────────────────────────────

    /// Human-triggered retry of a terminal incident. Grants exactly one
    /// further attempt, appended with the next dense number; history and
    /// identity are preserved.
    pub async fn retry(&self, id: &str) -> Result<bool> {
        let Some(error) = self.db.get_error(id)? else {
            return Ok(false);
        };
        if !matches!(
            error.status,
            ErrorStatus::Escalated | ErrorStatus::Ignored | ErrorStatus::NeedsManualReview
        ) {
            return Ok(false);
        }
        let attempts = self.db.count_attempts(id)?;
        self.db.update_max_attempts(id, attempts + 1)?;
        self.db.update_error_status(id, ErrorStatus::Queued)?;
        info!(error_id = %id, attempts, "manual retry queued");
        self.emit(EngineEvent::Queued {
            error_id: id.to_string(),
        });
        Ok(true)
    }

    /// Human-triggered dismissal. A queued/waiting incident goes terminal
    /// immediately; an in-flight one is cancelled and transitions once its
    /// attempt unwinds (snapshot rollback included).
    pub async fn ignore(&self, id: &str) -> Result<bool> {
        let Some(error) = self.db.get_error(id)? else {
            return Ok(false);
        };
        if error.status.is_terminal() {
            return Ok(false);
        }
        if let Some(token) = self.cancellations.lock().await.get(id) {
            token.cancel();
            info!(error_id = %id, "in-flight fix attempt cancelled");
            return Ok(true);
        }
        self.db.update_error_status(id, ErrorStatus::Ignored)?;
        info!(error_id = %id, "incident ignored");
        self.emit(EngineEvent::Ignored {
            error_id: id.to_string(),
        });
        Ok(true)
    }
}
