use anyhow::{Context, Result};
use async_trait::async_trait;
use remedy_core::{
    agent::FixBackend,
    types::{DetectedError, FixContext, FixOutcome},
};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::event::parse_stream;
use crate::prompt::build_fix_prompt;

/// Runs Claude Code as a subprocess in the incident's workspace and folds
/// the result into a `FixOutcome`. Non-zero exit, malformed output, and
/// timeouts all come back as failed outcomes — nothing past this boundary
/// throws for agent-level trouble.
pub struct ClaudeFixBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
}

impl ClaudeFixBackend {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
        }
    }
}

#[async_trait]
impl FixBackend for ClaudeFixBackend {
    async fn run_fix(&self, error: &DetectedError, ctx: &FixContext) -> Result<FixOutcome> {
        let prompt = build_fix_prompt(error, &ctx.workspace);

        let args = vec![
            "--model".to_string(),
            ctx.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--allowedTools".to_string(),
            ctx.allowed_tools.clone(),
            "--max-turns".to_string(),
            ctx.max_turns.to_string(),
            "--print".to_string(),
            prompt,
        ];

        info!(
            error_id = %error.id,
            error_type = %error.error_type,
            workspace = %ctx.workspace,
            timeout_s = ctx.timeout_s,
            "spawning claude subprocess"
        );

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .kill_on_drop(true)
            .current_dir(&ctx.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let error_id = error.id.clone();
        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stderr_tail = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!(error_id = %error_id, "claude stderr: {}", l);
                                stderr_tail.push_str(&l);
                                stderr_tail.push('\n');
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!(error_id = %error_id, "claude stderr: {}", l);
                    stderr_tail.push_str(&l);
                    stderr_tail.push('\n');
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, stderr_tail, exit_status.success()))
        };

        let (raw_stream, stderr_tail, exited_ok) = if ctx.timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(ctx.timeout_s), io_future)
                .await
            {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    warn!(
                        error_id = %error.id,
                        timeout_s = ctx.timeout_s,
                        "claude subprocess timed out"
                    );
                    return Ok(FixOutcome::timed_out(ctx.timeout_s));
                }
            }
        } else {
            io_future.await?
        };

        let summary = parse_stream(&raw_stream);
        let success = exited_ok && !summary.is_error;

        let failure_reason = if success {
            None
        } else if !exited_ok {
            let tail: String = stderr_tail.chars().rev().take(300).collect();
            let tail: String = tail.chars().rev().collect();
            Some(if tail.trim().is_empty() {
                "claude exited with a non-zero status".to_string()
            } else {
                format!("claude exited with a non-zero status: {}", tail.trim())
            })
        } else {
            Some("claude reported an error result".to_string())
        };

        info!(
            error_id = %error.id,
            success,
            files = summary.files_modified.len(),
            output_len = summary.result_text.len(),
            "claude subprocess finished"
        );

        Ok(FixOutcome {
            success,
            files_modified: summary.files_modified,
            summary: summary.result_text,
            raw_stream,
            failure_reason,
            timed_out: false,
        })
    }
}
