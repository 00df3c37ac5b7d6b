use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    AttemptStatus, Category, DetectedError, ErrorStatus, FixAttempt, Severity, Snapshot,
    SnapshotSubject,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

fn parse_string_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

// ── Row mappers ───────────────────────────────────────────────────────────

const ERROR_COLUMNS: &str = "id, error_type, message, normalized_message, stack_trace, \
     module_name, file_path, line_number, context_before, context_after, \
     severity, category, auto_fixable, requires_restart, status, occurrences, \
     max_attempts, detected_at, last_seen_at, resolved_at";

fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectedError> {
    let context_before: String = row.get(8)?;
    let context_after: String = row.get(9)?;
    let severity: String = row.get(10)?;
    let category: String = row.get(11)?;
    let status: String = row.get(14)?;
    let detected_at: String = row.get(17)?;
    let last_seen_at: String = row.get(18)?;
    let resolved_at: Option<String> = row.get(19)?;
    Ok(DetectedError {
        id: row.get(0)?,
        error_type: row.get(1)?,
        message: row.get(2)?,
        normalized_message: row.get(3)?,
        stack_trace: row.get(4)?,
        module_name: row.get(5)?,
        file_path: row.get(6)?,
        line_number: row.get(7)?,
        context_before: parse_string_list(&context_before),
        context_after: parse_string_list(&context_after),
        severity: Severity::from_str(&severity),
        category: Category::from_str(&category),
        auto_fixable: row.get::<_, i64>(12)? != 0,
        requires_restart: row.get::<_, i64>(13)? != 0,
        status: ErrorStatus::from_str(&status),
        occurrences: row.get(15)?,
        max_attempts: row.get(16)?,
        detected_at: parse_ts(&detected_at),
        last_seen_at: parse_ts(&last_seen_at),
        resolved_at: resolved_at.as_deref().map(parse_ts),
    })
}

const ATTEMPT_COLUMNS: &str = "id, error_id, attempt_number, status, files_modified, \
     failure_reason, execution_time_s, invoked_at, completed_at";

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<FixAttempt> {
    let status: String = row.get(3)?;
    let files: String = row.get(4)?;
    let invoked_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    Ok(FixAttempt {
        id: row.get(0)?,
        error_id: row.get(1)?,
        attempt_number: row.get(2)?,
        status: AttemptStatus::from_str(&status),
        files_modified: parse_string_list(&files),
        failure_reason: row.get(5)?,
        execution_time_s: row.get(6)?,
        invoked_at: parse_ts(&invoked_at),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let subject: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    let retained_until: String = row.get(4)?;
    Ok(Snapshot {
        id: row.get(0)?,
        subject: SnapshotSubject::from_str(&subject),
        location: row.get(2)?,
        created_at: parse_ts(&created_at),
        retained_until: parse_ts(&retained_until),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Errors ────────────────────────────────────────────────────────────

    pub fn insert_error(&self, error: &DetectedError) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO errors \
             (id, error_type, message, normalized_message, stack_trace, module_name, \
              file_path, line_number, context_before, context_after, severity, category, \
              auto_fixable, requires_restart, status, occurrences, max_attempts, \
              detected_at, last_seen_at, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                     ?16, ?17, ?18, ?19, ?20)",
            params![
                error.id,
                error.error_type,
                error.message,
                error.normalized_message,
                error.stack_trace,
                error.module_name,
                error.file_path,
                error.line_number,
                to_json_list(&error.context_before),
                to_json_list(&error.context_after),
                error.severity.as_str(),
                error.category.as_str(),
                error.auto_fixable as i64,
                error.requires_restart as i64,
                error.status.as_str(),
                error.occurrences,
                error.max_attempts,
                fmt_ts(error.detected_at),
                fmt_ts(error.last_seen_at),
                error.resolved_at.map(fmt_ts),
            ],
        )
        .context("insert_error")?;
        Ok(())
    }

    pub fn get_error(&self, id: &str) -> Result<Option<DetectedError>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {ERROR_COLUMNS} FROM errors WHERE id = ?1"),
                params![id],
                row_to_error,
            )
            .optional()
            .context("get_error")?;
        Ok(result)
    }

    pub fn list_errors(&self, status: Option<ErrorStatus>) -> Result<Vec<DetectedError>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ERROR_COLUMNS} FROM errors \
             WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY detected_at DESC, id DESC"
        ))?;
        let errors = stmt
            .query_map(params![status.map(|s| s.as_str())], row_to_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_errors")?;
        Ok(errors)
    }

    /// Errors eligible for dispatch, oldest first.
    pub fn list_dispatchable(&self) -> Result<Vec<DetectedError>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ERROR_COLUMNS} FROM errors \
             WHERE status IN ('queued', 'waiting') AND auto_fixable = 1 \
             ORDER BY detected_at ASC"
        ))?;
        let errors = stmt
            .query_map([], row_to_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_dispatchable")?;
        Ok(errors)
    }

    /// Look up a non-terminal incident with the same dedup signature.
    pub fn find_open_by_signature(
        &self,
        error_type: &str,
        file_path: Option<&str>,
        line_number: Option<i64>,
        normalized_message: &str,
    ) -> Result<Option<DetectedError>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {ERROR_COLUMNS} FROM errors \
                     WHERE error_type = ?1 \
                       AND file_path IS ?2 \
                       AND line_number IS ?3 \
                       AND normalized_message = ?4 \
                       AND status IN ('queued', 'fixing', 'waiting') \
                     LIMIT 1"
                ),
                params![error_type, file_path, line_number, normalized_message],
                row_to_error,
            )
            .optional()
            .context("find_open_by_signature")?;
        Ok(result)
    }

    /// Record a repeat sighting of an open incident.
    pub fn touch_sighting(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE errors SET occurrences = occurrences + 1, last_seen_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )
        .context("touch_sighting")?;
        Ok(())
    }

    pub fn update_error_status(&self, id: &str, status: ErrorStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let resolved_at = if status == ErrorStatus::Resolved {
            Some(now_str())
        } else {
            None
        };
        conn.execute(
            "UPDATE errors SET status = ?1, resolved_at = COALESCE(?2, resolved_at) \
             WHERE id = ?3",
            params![status.as_str(), resolved_at, id],
        )
        .context("update_error_status")?;
        Ok(())
    }

    pub fn update_max_attempts(&self, id: &str, max_attempts: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE errors SET max_attempts = ?1 WHERE id = ?2",
            params![max_attempts, id],
        )
        .context("update_max_attempts")?;
        Ok(())
    }

    pub fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM errors GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("status_counts")?;
        Ok(counts)
    }

    // ── Fix attempts ──────────────────────────────────────────────────────

    /// Insert the attempt row before the backend runs, so a crash mid-fix
    /// still leaves a dense, persisted attempt count.
    pub fn insert_attempt(&self, error_id: &str, attempt_number: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO fix_attempts (error_id, attempt_number, status, invoked_at) \
             VALUES (?1, ?2, 'in_progress', ?3)",
            params![error_id, attempt_number, now_str()],
        )
        .context("insert_attempt")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finalize_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        files_modified: &[String],
        failure_reason: Option<&str>,
        execution_time_s: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE fix_attempts SET status = ?1, files_modified = ?2, \
             failure_reason = ?3, execution_time_s = ?4, completed_at = ?5 \
             WHERE id = ?6",
            params![
                status.as_str(),
                to_json_list(files_modified),
                failure_reason,
                execution_time_s,
                now_str(),
                attempt_id,
            ],
        )
        .context("finalize_attempt")?;
        Ok(())
    }

    pub fn count_attempts(&self, error_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM fix_attempts WHERE error_id = ?1",
                params![error_id],
                |row| row.get(0),
            )
            .context("count_attempts")?;
        Ok(count)
    }

    pub fn list_attempts(&self, error_id: &str) -> Result<Vec<FixAttempt>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM fix_attempts \
             WHERE error_id = ?1 ORDER BY attempt_number ASC"
        ))?;
        let attempts = stmt
            .query_map(params![error_id], row_to_attempt)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_attempts")?;
        Ok(attempts)
    }

    pub fn last_attempt(&self, error_id: &str) -> Result<Option<FixAttempt>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM fix_attempts \
                     WHERE error_id = ?1 ORDER BY attempt_number DESC LIMIT 1"
                ),
                params![error_id],
                row_to_attempt,
            )
            .optional()
            .context("last_attempt")?;
        Ok(result)
    }

    /// Fail any attempt left `in_progress` by a previous process. Returns
    /// the affected error ids so the engine can repair their status.
    pub fn fail_interrupted_attempts(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT DISTINCT error_id FROM fix_attempts WHERE status = 'in_progress'")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("fail_interrupted_attempts: select")?;
        conn.execute(
            "UPDATE fix_attempts SET status = 'failed', \
             failure_reason = 'interrupted by process restart', completed_at = ?1 \
             WHERE status = 'in_progress'",
            params![now_str()],
        )
        .context("fail_interrupted_attempts: update")?;
        Ok(ids)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO snapshots (id, subject, location, created_at, retained_until) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id,
                snapshot.subject.as_str(),
                snapshot.location,
                fmt_ts(snapshot.created_at),
                fmt_ts(snapshot.retained_until),
            ],
        )
        .context("insert_snapshot")?;
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, subject, location, created_at, retained_until \
             FROM snapshots ORDER BY created_at DESC",
        )?;
        let snapshots = stmt
            .query_map([], row_to_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_snapshots")?;
        Ok(snapshots)
    }

    /// Expired snapshots not referenced by an in-flight operation.
    pub fn list_expired_snapshots(&self) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, subject, location, created_at, retained_until \
             FROM snapshots WHERE retained_until < ?1 AND in_use = 0",
        )?;
        let snapshots = stmt
            .query_map(params![now_str()], row_to_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_expired_snapshots")?;
        Ok(snapshots)
    }

    pub fn set_snapshot_in_use(&self, id: &str, in_use: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE snapshots SET in_use = ?1 WHERE id = ?2",
            params![in_use as i64, id],
        )
        .context("set_snapshot_in_use")?;
        Ok(())
    }

    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])
            .context("delete_snapshot")?;
        Ok(())
    }

    // ── Key/value state ───────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_state")?;
        Ok(result)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .context("set_state")?;
        Ok(())
    }

    pub fn get_ts(&self, key: &str) -> i64 {
        self.get_state(key)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_ts(&self, key: &str, ts: i64) {
        let _ = self.set_state(key, &ts.to_string());
    }

    /// Durable tail offset for a log source, keyed by path.
    pub fn get_tail_offset(&self, path: &str) -> u64 {
        self.get_state(&format!("tail_offset:{path}"))
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_tail_offset(&self, path: &str, offset: u64) -> Result<()> {
        self.set_state(&format!("tail_offset:{path}"), &offset.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::normalize_message;

    fn open_db() -> Db {
        let mut db = Db::open(":memory:").unwrap();
        db.migrate().unwrap();
        db
    }

    fn make_error(id: &str, status: ErrorStatus) -> DetectedError {
        DetectedError {
            id: id.to_string(),
            error_type: "ImportError".into(),
            message: "cannot import name 'foo'".into(),
            normalized_message: normalize_message("cannot import name 'foo'"),
            stack_trace: Some("Traceback (most recent call last):".into()),
            module_name: Some("sale_custom".into()),
            file_path: Some("/addons/sale_custom/models/sale.py".into()),
            line_number: Some(12),
            context_before: vec!["line a".into(), "line b".into()],
            context_after: vec![],
            severity: Severity::High,
            category: Category::Python,
            auto_fixable: true,
            requires_restart: true,
            status,
            occurrences: 1,
            max_attempts: 5,
            detected_at: Utc::now(),
            last_seen_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn error_round_trip() {
        let db = open_db();
        let error = make_error("e1", ErrorStatus::Queued);
        db.insert_error(&error).unwrap();

        let loaded = db.get_error("e1").unwrap().unwrap();
        assert_eq!(loaded.error_type, "ImportError");
        assert_eq!(loaded.status, ErrorStatus::Queued);
        assert_eq!(loaded.context_before, error.context_before);
        assert_eq!(loaded.line_number, Some(12));
        assert_eq!(loaded.severity, Severity::High);
        assert!(loaded.requires_restart);
    }

    #[test]
    fn signature_lookup_only_matches_open_incidents() {
        let db = open_db();
        let error = make_error("e1", ErrorStatus::Resolved);
        db.insert_error(&error).unwrap();

        let found = db
            .find_open_by_signature(
                "ImportError",
                Some("/addons/sale_custom/models/sale.py"),
                Some(12),
                &error.normalized_message,
            )
            .unwrap();
        assert!(found.is_none());

        db.insert_error(&make_error("e2", ErrorStatus::Fixing)).unwrap();
        let found = db
            .find_open_by_signature(
                "ImportError",
                Some("/addons/sale_custom/models/sale.py"),
                Some(12),
                &error.normalized_message,
            )
            .unwrap();
        assert_eq!(found.unwrap().id, "e2");
    }

    #[test]
    fn signature_lookup_handles_missing_location() {
        let db = open_db();
        let mut error = make_error("e1", ErrorStatus::Queued);
        error.file_path = None;
        error.line_number = None;
        db.insert_error(&error).unwrap();

        let found = db
            .find_open_by_signature("ImportError", None, None, &error.normalized_message)
            .unwrap();
        assert_eq!(found.unwrap().id, "e1");
    }

    #[test]
    fn touch_sighting_bumps_occurrences() {
        let db = open_db();
        db.insert_error(&make_error("e1", ErrorStatus::Queued)).unwrap();
        db.touch_sighting("e1").unwrap();
        db.touch_sighting("e1").unwrap();
        assert_eq!(db.get_error("e1").unwrap().unwrap().occurrences, 3);
    }

    #[test]
    fn attempt_numbers_are_unique_per_error() {
        let db = open_db();
        db.insert_error(&make_error("e1", ErrorStatus::Fixing)).unwrap();
        db.insert_attempt("e1", 1).unwrap();
        assert!(db.insert_attempt("e1", 1).is_err());
        db.insert_attempt("e1", 2).unwrap();
        assert_eq!(db.count_attempts("e1").unwrap(), 2);
    }

    #[test]
    fn attempts_listed_dense_and_ordered() {
        let db = open_db();
        db.insert_error(&make_error("e1", ErrorStatus::Fixing)).unwrap();
        for n in 1..=3 {
            let id = db.insert_attempt("e1", n).unwrap();
            db.finalize_attempt(id, AttemptStatus::Failed, &[], Some("no"), 1.0)
                .unwrap();
        }
        let attempts = db.list_attempts("e1").unwrap();
        let numbers: Vec<i64> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(attempts.iter().all(|a| a.completed_at.is_some()));
    }

    #[test]
    fn interrupted_attempts_fail_on_recovery() {
        let db = open_db();
        db.insert_error(&make_error("e1", ErrorStatus::Fixing)).unwrap();
        db.insert_attempt("e1", 1).unwrap();

        let ids = db.fail_interrupted_attempts().unwrap();
        assert_eq!(ids, vec!["e1".to_string()]);

        let attempt = db.last_attempt("e1").unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(
            attempt.failure_reason.as_deref(),
            Some("interrupted by process restart")
        );
    }

    #[test]
    fn resolved_status_stamps_resolved_at() {
        let db = open_db();
        db.insert_error(&make_error("e1", ErrorStatus::Fixing)).unwrap();
        db.update_error_status("e1", ErrorStatus::Resolved).unwrap();
        assert!(db.get_error("e1").unwrap().unwrap().resolved_at.is_some());
    }

    #[test]
    fn tail_offset_round_trip() {
        let db = open_db();
        assert_eq!(db.get_tail_offset("/var/log/x.log"), 0);
        db.set_tail_offset("/var/log/x.log", 1000).unwrap();
        assert_eq!(db.get_tail_offset("/var/log/x.log"), 1000);
        db.set_tail_offset("/var/log/x.log", 0).unwrap();
        assert_eq!(db.get_tail_offset("/var/log/x.log"), 0);
    }

    #[test]
    fn expired_snapshot_listing_respects_in_use() {
        let db = open_db();
        let snapshot = Snapshot {
            id: "s1".into(),
            subject: SnapshotSubject::Database,
            location: "/backups/s1".into(),
            created_at: Utc::now() - chrono::Duration::days(30),
            retained_until: Utc::now() - chrono::Duration::days(23),
        };
        db.insert_snapshot(&snapshot).unwrap();

        assert_eq!(db.list_expired_snapshots().unwrap().len(), 1);
        db.set_snapshot_in_use("s1", true).unwrap();
        assert!(db.list_expired_snapshots().unwrap().is_empty());
        db.set_snapshot_in_use("s1", false).unwrap();
        assert_eq!(db.list_expired_snapshots().unwrap().len(), 1);
    }
}
