use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Start/stop control over the monitored service. Narrow on purpose so
/// tests can substitute a deterministic fake; the engine's restart lock
/// wraps every stop/start sequence, implementations do not serialize
/// themselves.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn stop(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    /// Poll the service until it answers healthy or the budget runs out.
    async fn await_ready(&self, timeout: Duration) -> bool;
}

/// systemd-managed service probed over HTTP.
pub struct SystemdControl {
    service: String,
    health_url: String,
    client: reqwest::Client,
}

impl SystemdControl {
    pub fn new(service: impl Into<String>, health_url: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            health_url: health_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn systemctl(&self, action: &str) -> Result<()> {
        let output = Command::new("systemctl")
            .args([action, self.service.as_str()])
            .output()
            .await
            .with_context(|| format!("systemctl {action} {}", self.service))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("systemctl {action} {} failed: {}", self.service, stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for SystemdControl {
    async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await?;
        info!(service = %self.service, "service stopped");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.systemctl("start").await?;
        info!(service = %self.service, "service started");
        Ok(())
    }

    async fn await_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let probe = self
                .client
                .get(&self.health_url)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if let Ok(resp) = probe {
                if resp.status().is_success() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        warn!(service = %self.service, timeout_s = timeout.as_secs(), "readiness probe timed out");
        false
    }
}
