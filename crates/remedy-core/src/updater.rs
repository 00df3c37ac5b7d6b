use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::config::Config;
use crate::db::Db;
use crate::service::ServiceControl;
use crate::types::EngineEvent;

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub modules: Vec<String>,
    pub backup_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Success,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModuleFailure {
    pub module: String,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UpdateOutcome {
    pub status: UpdateStatus,
    pub modules_updated: Vec<String>,
    pub modules_failed: Vec<ModuleFailure>,
    pub snapshot_id: Option<String>,
    pub duration_s: f64,
    pub error: Option<String>,
}

impl UpdateOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: UpdateStatus::Failed,
            modules_updated: Vec::new(),
            modules_failed: Vec::new(),
            snapshot_id: None,
            duration_s: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Applies module updates under the same safety net as fix attempts:
/// database snapshot first, service stopped under the shared restart lock,
/// rollback when every module fails. Only one update runs at a time.
pub struct Updater {
    config: Arc<Config>,
    db: Arc<Db>,
    backup: Arc<BackupManager>,
    service: Arc<dyn ServiceControl>,
    restart_lock: Arc<Mutex<()>>,
    event_tx: broadcast::Sender<EngineEvent>,
    updating: AtomicBool,
}

impl Updater {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        backup: Arc<BackupManager>,
        service: Arc<dyn ServiceControl>,
        restart_lock: Arc<Mutex<()>>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            config,
            db,
            backup,
            service,
            restart_lock,
            event_tx,
            updating: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    pub async fn update_modules(&self, request: UpdateRequest) -> UpdateOutcome {
        if request.modules.is_empty() {
            return UpdateOutcome::failed("no modules requested");
        }
        if self.updating.swap(true, Ordering::SeqCst) {
            return UpdateOutcome::failed("another update is in progress");
        }
        let outcome = self.run_update(&request).await;
        self.updating.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_update(&self, request: &UpdateRequest) -> UpdateOutcome {
        let started = std::time::Instant::now();
        info!(modules = ?request.modules, "module update started");
        self.emit(EngineEvent::UpdateStarted {
            modules: request.modules.clone(),
        });

        // Snapshot failure blocks the whole update; proceeding without a
        // restore point is not an option.
        let snapshot = if request.backup_before {
            match self.backup.snapshot_database().await {
                Ok(s) => {
                    if let Err(e) = self.db.set_snapshot_in_use(&s.id, true) {
                        warn!(snapshot_id = %s.id, "could not flag snapshot in use: {e}");
                    }
                    Some(s)
                }
                Err(e) => {
                    let reason = format!("pre-update snapshot failed: {e}");
                    error!("{reason}");
                    self.emit(EngineEvent::UpdateFailed {
                        modules: request.modules.clone(),
                        reason: reason.clone(),
                    });
                    return UpdateOutcome::failed(reason);
                }
            }
        } else {
            None
        };

        let mut updated = Vec::new();
        let mut failed = Vec::new();

        // The restart lock is held across stop → update → start so no fix
        // attempt can race the stopped service.
        {
            let _guard = self.restart_lock.lock().await;
            if let Err(e) = self.service.stop().await {
                warn!("service stop before update failed: {e}");
            }

            for module in &request.modules {
                match self.update_single_module(module).await {
                    Ok(()) => {
                        info!(module, "module updated");
                        updated.push(module.clone());
                    }
                    Err(e) => {
                        error!(module, "module update failed: {e}");
                        failed.push(ModuleFailure {
                            module: module.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if let Err(e) = self.service.start().await {
                warn!("service start after update failed: {e}");
            }
        }
        if !self
            .service
            .await_ready(Duration::from_secs(self.config.ready_timeout_s))
            .await
        {
            warn!("service not ready after module update");
        }

        let all_failed = !failed.is_empty() && updated.is_empty();
        let status = if all_failed {
            match &snapshot {
                Some(s) => {
                    warn!(snapshot_id = %s.id, "all modules failed, rolling back");
                    match self.backup.restore(s).await {
                        Ok(()) => {
                            self.emit(EngineEvent::UpdateRolledBack {
                                snapshot_id: s.id.clone(),
                            });
                            UpdateStatus::RolledBack
                        }
                        Err(e) => {
                            error!(snapshot_id = %s.id, "rollback failed: {e}");
                            UpdateStatus::Failed
                        }
                    }
                }
                None => UpdateStatus::Failed,
            }
        } else {
            UpdateStatus::Success
        };

        if let Some(s) = &snapshot {
            if let Err(e) = self.db.set_snapshot_in_use(&s.id, false) {
                warn!(snapshot_id = %s.id, "could not release snapshot: {e}");
            }
        }

        let duration_s = started.elapsed().as_secs_f64();
        match status {
            UpdateStatus::Success => {
                info!(modules = ?updated, failed = failed.len(), duration_s, "module update completed");
                self.emit(EngineEvent::UpdateCompleted {
                    modules: updated.clone(),
                    duration_s,
                });
            }
            _ => {
                let reason = failed
                    .first()
                    .map(|f| f.reason.clone())
                    .unwrap_or_else(|| "update failed".to_string());
                self.emit(EngineEvent::UpdateFailed {
                    modules: request.modules.clone(),
                    reason,
                });
            }
        }

        UpdateOutcome {
            status,
            modules_updated: updated,
            modules_failed: failed,
            snapshot_id: snapshot.map(|s| s.id),
            duration_s,
            error: None,
        }
    }

    async fn update_single_module(&self, module: &str) -> Result<()> {
        let cmd = self
            .config
            .update_cmd
            .replace("{module}", module)
            .replace("{database}", &self.config.database);

        let run = tokio::process::Command::new("sh")
            .args(["-c", cmd.as_str()])
            .output();
        let output = tokio::time::timeout(Duration::from_secs(self.config.update_timeout_s), run)
            .await
            .map_err(|_| {
                anyhow::anyhow!("update timed out after {}s", self.config.update_timeout_s)
            })?
            .context("run update command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            bail!("update command failed: {}", detail.trim());
        }
        Ok(())
    }
}
