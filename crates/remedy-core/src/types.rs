use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Classification ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Python,
    Database,
    Odoo,
    Asset,
    Dependency,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Database => "database",
            Self::Odoo => "odoo",
            Self::Asset => "asset",
            Self::Dependency => "dependency",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "database" => Self::Database,
            "odoo" => Self::Odoo,
            "asset" => Self::Asset,
            "dependency" => Self::Dependency,
            _ => Self::Python,
        }
    }
}

// ── Incident lifecycle ───────────────────────────────────────────────────

/// Lifecycle status of one deduplicated incident.
///
/// `queued → fixing → (waiting → fixing)* → resolved | escalated`, with
/// `ignored` reachable from any non-terminal state and
/// `needs_manual_review` for incidents the engine will never hand to the
/// fix backend (not auto-fixable, or snapshot failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Queued,
    Fixing,
    Waiting,
    Resolved,
    Escalated,
    NeedsManualReview,
    Ignored,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fixing => "fixing",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::NeedsManualReview => "needs_manual_review",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "fixing" => Self::Fixing,
            "waiting" => Self::Waiting,
            "resolved" => Self::Resolved,
            "escalated" => Self::Escalated,
            "needs_manual_review" => Self::NeedsManualReview,
            _ => Self::Ignored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Escalated | Self::NeedsManualReview | Self::Ignored
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Success,
    Failed,
    Timeout,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "success" => Self::Success,
            "timeout" => Self::Timeout,
            _ => Self::Failed,
        }
    }
}

/// A deduplicated error incident as stored in the database.
///
/// Created once per dedup signature; subsequent sightings of the same
/// signature while the incident is non-terminal bump `occurrences` instead
/// of creating a new row. Status transitions are the only mutation after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedError {
    pub id: String,
    pub error_type: String,
    pub message: String,
    /// Message with digit runs collapsed, used in the dedup signature.
    pub normalized_message: String,
    pub stack_trace: Option<String>,
    /// Addon module the traceback points into, when resolvable.
    pub module_name: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
    pub severity: Severity,
    pub category: Category,
    pub auto_fixable: bool,
    pub requires_restart: bool,
    pub status: ErrorStatus,
    pub occurrences: i64,
    /// Attempt ceiling for this incident. Raised by manual retry only.
    pub max_attempts: i64,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DetectedError {
    /// Dedup signature: two sightings with the same signature are the same
    /// incident.
    pub fn signature(&self) -> String {
        signature_of(
            &self.error_type,
            self.file_path.as_deref(),
            self.line_number,
            &self.normalized_message,
        )
    }
}

pub fn signature_of(
    error_type: &str,
    file_path: Option<&str>,
    line_number: Option<i64>,
    normalized_message: &str,
) -> String {
    format!(
        "{}|{}:{}|{}",
        error_type,
        file_path.unwrap_or("?"),
        line_number.unwrap_or(0),
        normalized_message
    )
}

/// Collapse volatile content (ids, counters, addresses) so messages that
/// differ only in numbers dedup to the same incident.
pub fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for c in message.trim().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// One invocation of the fix backend plus its verification outcome.
/// Append-only: rows are inserted before the backend runs and finalized
/// exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: i64,
    pub error_id: String,
    /// 1-indexed and dense; enforced by a UNIQUE(error_id, attempt_number)
    /// constraint.
    pub attempt_number: i64,
    pub status: AttemptStatus,
    pub files_modified: Vec<String>,
    pub failure_reason: Option<String>,
    pub execution_time_s: f64,
    pub invoked_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Snapshots ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSubject {
    Database,
    FixTarget,
}

impl SnapshotSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::FixTarget => "fix_target",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "database" => Self::Database,
            _ => Self::FixTarget,
        }
    }
}

/// A restorable point-in-time copy taken before a mutating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub subject: SnapshotSubject,
    /// Directory containing the payload and its manifest.json.
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub retained_until: DateTime<Utc>,
}

/// Written next to every snapshot payload; a directory without a readable
/// manifest is never restored from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    pub subject: SnapshotSubject,
    pub database: Option<String>,
    pub files: Vec<String>,
    /// Directory a fix-target archive restores into.
    pub root: Option<String>,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
}

// ── Retry policy ─────────────────────────────────────────────────────────

/// Exponential backoff between fix attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub base_delay_s: u64,
    pub multiplier: f64,
    pub max_delay_s: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_s: 60,
            multiplier: 2.0,
            max_delay_s: 960,
        }
    }
}

impl RetryPolicy {
    /// Seconds to wait before attempt `k` (1-indexed). Attempt 1 runs
    /// immediately; attempt k waits base × multiplier^(k−2), capped.
    pub fn delay_before(&self, attempt: i64) -> u64 {
        if attempt <= 1 {
            return 0;
        }
        let exp = (attempt - 2) as i32;
        let delay = self.base_delay_s as f64 * self.multiplier.powi(exp);
        (delay as u64).min(self.max_delay_s)
    }
}

// ── Fix backend boundary ─────────────────────────────────────────────────

/// Everything the fix backend needs beyond the incident itself.
#[derive(Debug, Clone)]
pub struct FixContext {
    /// Working directory handed to the agent subprocess.
    pub workspace: String,
    pub model: String,
    pub allowed_tools: String,
    pub max_turns: u32,
    /// Wall-clock ceiling for one invocation (0 = no limit).
    pub timeout_s: u64,
}

/// Outcome of one fix invocation. Agent-level failures (non-zero exit,
/// malformed output, timeout) come back as `success = false`, never as an
/// `Err` — the engine treats them as ordinary failed attempts.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub success: bool,
    pub files_modified: Vec<String>,
    /// Human-readable description of what the agent did.
    pub summary: String,
    /// Raw NDJSON transcript, persisted for the attempt record.
    pub raw_stream: String,
    pub failure_reason: Option<String>,
    pub timed_out: bool,
}

impl FixOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            files_modified: Vec::new(),
            summary: String::new(),
            raw_stream: String::new(),
            failure_reason: Some(reason.into()),
            timed_out: false,
        }
    }

    pub fn timed_out(timeout_s: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(format!("fix agent timed out after {timeout_s}s"))
        }
    }
}

// ── Engine events ────────────────────────────────────────────────────────

/// Broadcast once per state transition, in transition order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Detected {
        error_id: String,
        error_type: String,
        severity: Severity,
    },
    Queued {
        error_id: String,
    },
    NeedsManualReview {
        error_id: String,
    },
    Fixing {
        error_id: String,
        attempt: i64,
    },
    FixFailed {
        error_id: String,
        attempt: i64,
        reason: String,
    },
    Resolved {
        error_id: String,
        attempt: i64,
    },
    Escalated {
        error_id: String,
        attempts: i64,
    },
    Ignored {
        error_id: String,
    },
    SnapshotFailed {
        error_id: String,
        reason: String,
    },
    UpdateStarted {
        modules: Vec<String>,
    },
    UpdateCompleted {
        modules: Vec<String>,
        duration_s: f64,
    },
    UpdateFailed {
        modules: Vec<String>,
        reason: String,
    },
    UpdateRolledBack {
        snapshot_id: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detected { .. } => "detected",
            Self::Queued { .. } => "queued",
            Self::NeedsManualReview { .. } => "needs_manual_review",
            Self::Fixing { .. } => "fixing",
            Self::FixFailed { .. } => "fix_failed",
            Self::Resolved { .. } => "resolved",
            Self::Escalated { .. } => "escalated",
            Self::Ignored { .. } => "ignored",
            Self::SnapshotFailed { .. } => "snapshot_failed",
            Self::UpdateStarted { .. } => "update_started",
            Self::UpdateCompleted { .. } => "update_completed",
            Self::UpdateFailed { .. } => "update_failed",
            Self::UpdateRolledBack { .. } => "update_rolled_back",
        }
    }

    pub fn error_id(&self) -> Option<&str> {
        match self {
            Self::Detected { error_id, .. }
            | Self::Queued { error_id }
            | Self::NeedsManualReview { error_id }
            | Self::Fixing { error_id, .. }
            | Self::FixFailed { error_id, .. }
            | Self::Resolved { error_id, .. }
            | Self::Escalated { error_id, .. }
            | Self::Ignored { error_id }
            | Self::SnapshotFailed { error_id, .. } => Some(error_id),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_matches_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), 0);
        assert_eq!(policy.delay_before(2), 60);
        assert_eq!(policy.delay_before(3), 120);
        assert_eq!(policy.delay_before(4), 240);
        assert_eq!(policy.delay_before(5), 480);
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(6), 960);
        assert_eq!(policy.delay_before(10), 960);
    }

    #[test]
    fn cumulative_wait_to_exhaustion() {
        let policy = RetryPolicy::default();
        let total: u64 = (1..=policy.max_attempts).map(|k| policy.delay_before(k)).sum();
        assert_eq!(total, 900);
    }

    #[test]
    fn normalize_collapses_digit_runs() {
        assert_eq!(
            normalize_message("KeyError: 'res.partner(42,)'"),
            "keyerror: 'res.partner(#,)'"
        );
        assert_eq!(normalize_message("  Port 8069 refused  "), "port # refused");
    }

    #[test]
    fn signature_ignores_raw_message_digits() {
        let a = signature_of("KeyError", Some("/a/b.py"), Some(10), &normalize_message("id 1"));
        let b = signature_of("KeyError", Some("/a/b.py"), Some(10), &normalize_message("id 2"));
        assert_eq!(a, b);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            ErrorStatus::Queued,
            ErrorStatus::Fixing,
            ErrorStatus::Waiting,
            ErrorStatus::Resolved,
            ErrorStatus::Escalated,
            ErrorStatus::NeedsManualReview,
            ErrorStatus::Ignored,
        ] {
            assert_eq!(ErrorStatus::from_str(s.as_str()), s);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!ErrorStatus::Queued.is_terminal());
        assert!(!ErrorStatus::Fixing.is_terminal());
        assert!(!ErrorStatus::Waiting.is_terminal());
        assert!(ErrorStatus::Resolved.is_terminal());
        assert!(ErrorStatus::Escalated.is_terminal());
        assert!(ErrorStatus::NeedsManualReview.is_terminal());
        assert!(ErrorStatus::Ignored.is_terminal());
    }

    #[test]
    fn event_kinds() {
        let e = EngineEvent::FixFailed {
            error_id: "e1".into(),
            attempt: 2,
            reason: "verification failed".into(),
        };
        assert_eq!(e.kind(), "fix_failed");
        assert_eq!(e.error_id(), Some("e1"));
    }
}
