use std::collections::VecDeque;

use regex::Regex;

use crate::tailer::LogBatch;

const MAX_MESSAGE_CHARS: usize = 500;

/// A structured error lifted out of the raw log stream, before
/// classification and dedup.
#[derive(Debug, Clone)]
pub struct CandidateError {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub module_name: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
    pub raw_block: String,
}

struct Pending {
    candidate: CandidateError,
    wanted_after: usize,
}

/// Assembles multi-line log records and matches them against an ordered
/// signature table. First matching signature wins; table order is part of
/// the contract. Unmatched non-error lines are dropped — only the bounded
/// context window is ever retained.
pub struct Extractor {
    signatures: Vec<(String, Regex)>,
    context_window: usize,
    context: VecDeque<String>,
    block: Vec<String>,
    block_level: String,
    block_context: Vec<String>,
    in_block: bool,
    pending: Vec<Pending>,
    record_start: Regex,
    traceback_file: Regex,
    module_path: Regex,
    exception_line: Regex,
}

fn static_regex(pattern: &str) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(pattern).expect("static pattern compiles")
}

/// The built-in signature table, in match-priority order. The ordering is
/// significant and preserved exactly; extend by appending.
fn default_signatures() -> Vec<(String, Regex)> {
    let table: &[(&str, &str)] = &[
        // Python exceptions
        ("ImportError", r"ImportError: (.*)"),
        ("ModuleNotFoundError", r"ModuleNotFoundError: No module named '(.*)'"),
        ("SyntaxError", r"SyntaxError: (.*)"),
        ("AttributeError", r"AttributeError: (.*)"),
        ("TypeError", r"TypeError: (.*)"),
        ("ValueError", r"ValueError: (.*)"),
        ("KeyError", r"KeyError: (.*)"),
        ("NameError", r"NameError: (.*)"),
        ("IndentationError", r"IndentationError: (.*)"),
        // Database driver
        ("psycopg2.OperationalError", r"psycopg2\.OperationalError: (.*)"),
        ("psycopg2.IntegrityError", r"psycopg2\.IntegrityError: (.*)"),
        ("psycopg2.ProgrammingError", r"psycopg2\.ProgrammingError: (.*)"),
        // Framework exceptions
        ("ValidationError", r"odoo\.exceptions\.ValidationError: (.*)"),
        ("UserError", r"odoo\.exceptions\.UserError: (.*)"),
        ("AccessError", r"odoo\.exceptions\.AccessError: (.*)"),
        ("MissingError", r"odoo\.exceptions\.MissingError: (.*)"),
        ("ParseError", r"odoo\.tools\.convert\.ParseError: (.*)"),
        // Assets
        ("JavaScriptError", r"Error: (.*\.js:\d+)"),
        ("SCSSCompilation", r"Error compiling scss: (.*)"),
        ("AssetError", r"AssetError: (.*)"),
    ];
    table
        .iter()
        .map(|(name, pattern)| (name.to_string(), static_regex(pattern)))
        .collect()
}

impl Extractor {
    pub fn new(context_window: usize) -> Self {
        Self {
            signatures: default_signatures(),
            context_window,
            context: VecDeque::new(),
            block: Vec::new(),
            block_level: String::new(),
            block_context: Vec::new(),
            in_block: false,
            pending: Vec::new(),
            // Log record header: timestamp, pid, level.
            record_start: static_regex(
                r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3} \d+ (ERROR|CRITICAL|WARNING)",
            ),
            traceback_file: static_regex(r#"File "([^"]+)", line (\d+)"#),
            module_path: static_regex(r"/(?:custom_)?addons/([^/]+)/"),
            // The unindented exception line that terminates a traceback,
            // e.g. `ImportError: ...` or `odoo.exceptions.ValidationError: ...`.
            exception_line: static_regex(r"^[A-Za-z_][A-Za-z0-9_.]*: "),
        }
    }

    /// One-shot scan of a text slab (verifier re-reads, manual scans).
    pub fn scan(text: &str, context_window: usize) -> Vec<CandidateError> {
        let mut extractor = Self::new(context_window);
        let batch = LogBatch {
            lines: text.lines().map(str::to_string).collect(),
            reset: false,
        };
        let mut found = extractor.push_batch(&batch);
        found.extend(extractor.flush());
        found
    }

    /// Feed a batch of raw lines; returns the records completed within it.
    /// An error block still open at batch end is carried into the next
    /// call, so records spanning read boundaries stay whole.
    pub fn push_batch(&mut self, batch: &LogBatch) -> Vec<CandidateError> {
        let mut out = Vec::new();

        if batch.reset {
            // The source was truncated; whatever block was open will never
            // be completed. Close it and start from clean state.
            out.extend(self.flush());
            self.context.clear();
        }

        for line in &batch.lines {
            if line.trim().is_empty() {
                continue;
            }

            for p in &mut self.pending {
                if p.candidate.context_after.len() < p.wanted_after {
                    p.candidate.context_after.push(line.clone());
                }
            }

            if let Some(caps) = self.record_start.captures(line) {
                let level = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                if self.in_block && self.close_block() {
                    self.seed_context_after(line);
                }
                self.in_block = true;
                self.block_level = level;
                self.block_context = self.context.iter().rev().take(self.context_window).cloned().collect();
                self.block_context.reverse();
                self.block = vec![line.clone()];
            } else if self.in_block {
                let in_traceback = self.block.iter().any(|l| l.contains("Traceback"));
                if line.starts_with(' ') || line.starts_with('\t') || line.contains("Traceback") {
                    self.block.push(line.clone());
                } else if in_traceback && self.exception_line.is_match(line) {
                    // The unindented `SomeError: message` line both belongs
                    // to the traceback and ends it.
                    self.block.push(line.clone());
                    self.close_block();
                } else if self.close_block() {
                    // The line that ended the block is the first line of
                    // the record's after-context.
                    self.seed_context_after(line);
                }
            }

            self.context.push_back(line.clone());
            while self.context.len() > self.context_window * 2 {
                self.context.pop_front();
            }
        }

        out.extend(self.drain_pending());
        out
    }

    /// Force-close any open block and drain all pending records.
    pub fn flush(&mut self) -> Vec<CandidateError> {
        if self.in_block {
            self.close_block();
        }
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Vec<CandidateError> {
        self.pending.drain(..).map(|p| p.candidate).collect()
    }

    fn seed_context_after(&mut self, line: &str) {
        if let Some(p) = self.pending.last_mut() {
            if p.candidate.context_after.is_empty() && p.wanted_after > 0 {
                p.candidate.context_after.push(line.to_string());
            }
        }
    }

    /// Returns true when the closed block produced a record.
    fn close_block(&mut self) -> bool {
        self.in_block = false;
        let block = std::mem::take(&mut self.block);
        let level = std::mem::take(&mut self.block_level);
        let context_before = std::mem::take(&mut self.block_context);
        if block.is_empty() {
            return false;
        }

        let full_text = block.join("\n");
        if let Some(candidate) = self.match_block(&full_text, &level, &block, context_before) {
            self.pending.push(Pending {
                candidate,
                wanted_after: self.context_window,
            });
            return true;
        }
        false
    }

    fn match_block(
        &self,
        full_text: &str,
        level: &str,
        block: &[String],
        context_before: Vec<String>,
    ) -> Option<CandidateError> {
        for (name, pattern) in &self.signatures {
            if let Some(caps) = pattern.captures(full_text) {
                let message = caps
                    .get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| full_text.chars().take(MAX_MESSAGE_CHARS).collect());
                return Some(self.build_candidate(name.clone(), message, full_text, context_before));
            }
        }

        // ERROR/CRITICAL records that match no signature still become
        // incidents; the classifier's default bucket handles them.
        if level == "ERROR" || level == "CRITICAL" {
            let message = block
                .first()
                .map(|l| l.chars().take(MAX_MESSAGE_CHARS).collect())
                .unwrap_or_default();
            return Some(self.build_candidate(
                "UnknownError".to_string(),
                message,
                full_text,
                context_before,
            ));
        }

        None
    }

    fn build_candidate(
        &self,
        error_type: String,
        message: String,
        full_text: &str,
        context_before: Vec<String>,
    ) -> CandidateError {
        let (file_path, line_number) = self.extract_location(full_text);
        CandidateError {
            error_type,
            message: message.chars().take(2_000).collect(),
            stack_trace: extract_stack_trace(full_text),
            module_name: self
                .module_path
                .captures(full_text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
            file_path,
            line_number,
            context_before,
            context_after: Vec::new(),
            raw_block: full_text.chars().take(10_000).collect(),
        }
    }

    /// Last `File "…", line N` of the traceback is the actual error site.
    fn extract_location(&self, text: &str) -> (Option<String>, Option<i64>) {
        let last = self.traceback_file.captures_iter(text).last();
        match last {
            Some(caps) => {
                let file = caps.get(1).map(|m| m.as_str().to_string());
                let line = caps.get(2).and_then(|m| m.as_str().parse().ok());
                (file, line)
            }
            None => (None, None),
        }
    }
}

fn extract_stack_trace(text: &str) -> Option<String> {
    let start = text.find("Traceback")?;
    Some(text[start..].to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(lines: &[&str]) -> LogBatch {
        LogBatch {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            reset: false,
        }
    }

    fn header(level: &str, rest: &str) -> String {
        format!("2025-03-01 10:22:31,412 1234 {level} odoo.modules.loading: {rest}")
    }

    #[test]
    fn single_line_error_matches_signature() {
        let mut ex = Extractor::new(10);
        let mut found = ex.push_batch(&batch(&[&header("ERROR", "ValueError: bad input")]));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "ValueError");
        assert_eq!(found[0].message, "bad input");
    }

    #[test]
    fn traceback_block_assembles_into_one_record() {
        let mut ex = Extractor::new(10);
        let lines = [
            header("ERROR", "failed to load module"),
            "Traceback (most recent call last):".to_string(),
            r#"  File "/addons/sale_custom/models/sale.py", line 7, in <module>"#.to_string(),
            "    from odoo import fieldz".to_string(),
            r#"  File "/addons/sale_custom/models/order.py", line 42, in compute"#.to_string(),
            "ImportError: cannot import name 'fieldz'".to_string(),
            "2025-03-01 10:22:32,001 1234 INFO odoo: back to normal".to_string(),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut found = ex.push_batch(&batch(&refs));
        found.extend(ex.flush());

        assert_eq!(found.len(), 1);
        let c = &found[0];
        assert_eq!(c.error_type, "ImportError");
        assert_eq!(c.message, "cannot import name 'fieldz'");
        // Last traceback frame wins.
        assert_eq!(c.file_path.as_deref(), Some("/addons/sale_custom/models/order.py"));
        assert_eq!(c.line_number, Some(42));
        assert_eq!(c.module_name.as_deref(), Some("sale_custom"));
        assert!(c.stack_trace.as_deref().unwrap().starts_with("Traceback"));
    }

    #[test]
    fn block_spanning_two_batches_stays_whole() {
        let mut ex = Extractor::new(10);
        let first = [
            header("ERROR", "boom"),
            "Traceback (most recent call last):".to_string(),
        ];
        let refs: Vec<&str> = first.iter().map(String::as_str).collect();
        let found = ex.push_batch(&batch(&refs));
        assert!(found.is_empty());

        let mut found = ex.push_batch(&batch(&[
            "  File \"/addons/stock_x/models/move.py\", line 3, in <module>",
            "AttributeError: 'NoneType' object has no attribute 'ids'",
            "plain line ends the block",
        ]));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "AttributeError");
    }

    #[test]
    fn first_matching_signature_wins_in_table_order() {
        // Block contains both a ValueError and a KeyError line; ValueError
        // sits earlier in the table.
        let mut ex = Extractor::new(10);
        let lines = [
            header("ERROR", "mixed"),
            "  ValueError: first".to_string(),
            "  KeyError: second".to_string(),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut found = ex.push_batch(&batch(&refs));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "ValueError");
    }

    #[test]
    fn unmatched_error_block_becomes_unknown() {
        let mut ex = Extractor::new(10);
        let mut found = ex.push_batch(&batch(&[&header("CRITICAL", "worker exited unexpectedly")]));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "UnknownError");
    }

    #[test]
    fn unmatched_warning_is_discarded() {
        let mut ex = Extractor::new(10);
        let mut found = ex.push_batch(&batch(&[&header("WARNING", "slow query took 3s")]));
        found.extend(ex.flush());
        assert!(found.is_empty());
    }

    #[test]
    fn plain_lines_are_not_records() {
        let mut ex = Extractor::new(10);
        let mut found = ex.push_batch(&batch(&["just some stdout", "ValueError: not a record"]));
        found.extend(ex.flush());
        assert!(found.is_empty());
    }

    #[test]
    fn context_before_is_bounded() {
        let mut ex = Extractor::new(3);
        let mut lines: Vec<String> = (0..20).map(|i| format!("noise {i}")).collect();
        lines.push(header("ERROR", "KeyError: 'x'"));
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut found = ex.push_batch(&batch(&refs));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context_before, vec!["noise 17", "noise 18", "noise 19"]);
    }

    #[test]
    fn context_after_collects_following_lines() {
        let mut ex = Extractor::new(2);
        let lines = [
            header("ERROR", "KeyError: 'y'"),
            "after one".to_string(),
            "after two".to_string(),
            "after three".to_string(),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let found = ex.push_batch(&batch(&refs));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context_after, vec!["after one", "after two"]);
    }

    #[test]
    fn reset_batch_closes_open_block_and_clears_context() {
        let mut ex = Extractor::new(5);
        let first = [header("ERROR", "boom"), "Traceback (most recent call last):".to_string()];
        let refs: Vec<&str> = first.iter().map(String::as_str).collect();
        ex.push_batch(&batch(&refs));

        let found = ex.push_batch(&LogBatch {
            lines: vec![],
            reset: true,
        });
        // The truncated block still surfaces as an incident.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "UnknownError");

        // Context from before the reset does not leak into new records.
        let mut found = ex.push_batch(&batch(&[&header("ERROR", "ValueError: post-reset")]));
        found.extend(ex.flush());
        assert_eq!(found.len(), 1);
        assert!(found[0].context_before.is_empty());
    }

    #[test]
    fn scan_is_one_shot() {
        let text = format!("{}\n", header("ERROR", "TypeError: unsupported operand"));
        let found = Extractor::scan(&text, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_type, "TypeError");
    }
}
