use std::path::Path;

use remedy_core::types::DetectedError;

const CONTEXT_LINES: usize = 10;

/// Build the self-contained fix instruction handed to the agent. Carries
/// everything it needs — error identity, location, stack trace, and the
/// source lines around the failure — so the request never depends on
/// engine state the agent cannot see.
pub fn build_fix_prompt(error: &DetectedError, workspace: &str) -> String {
    let code_context = error
        .file_path
        .as_deref()
        .zip(error.line_number)
        .and_then(|(file, line)| read_code_context(file, line as usize, CONTEXT_LINES))
        .unwrap_or_else(|| "Not available".to_string());

    format!(
        "You are an expert Odoo developer fixing an error in a custom module.\n\
         \n\
         ## ERROR INFORMATION\n\
         - **Type**: {error_type}\n\
         - **Module**: {module}\n\
         - **File**: {file}\n\
         - **Line**: {line}\n\
         - **Workspace**: {workspace}\n\
         \n\
         ## ERROR MESSAGE\n\
         ```\n\
         {message}\n\
         ```\n\
         \n\
         ## STACK TRACE\n\
         ```\n\
         {stack_trace}\n\
         ```\n\
         \n\
         ## CONTEXT (surrounding code)\n\
         ```python\n\
         {code_context}\n\
         ```\n\
         \n\
         ## INSTRUCTIONS\n\
         1. Analyze the root cause of this error\n\
         2. Make the MINIMUM changes necessary to fix the error\n\
         3. Do NOT modify unrelated code\n\
         4. Do NOT add unnecessary comments or documentation\n\
         5. Verify the fix does not introduce new errors\n\
         \n\
         Apply the fix directly to the source file.",
        error_type = error.error_type,
        module = error.module_name.as_deref().unwrap_or("unknown"),
        file = error.file_path.as_deref().unwrap_or("unknown"),
        line = error
            .line_number
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        workspace = workspace,
        message = error.message,
        stack_trace = error.stack_trace.as_deref().unwrap_or("Not available"),
        code_context = code_context,
    )
}

/// Numbered source lines around the failure, the error line marked.
fn read_code_context(file: &str, line: usize, window: usize) -> Option<String> {
    let path = Path::new(file);
    if !path.exists() || line == 0 {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();

    let start = line.saturating_sub(window + 1);
    let end = (line + window).min(lines.len());
    if start >= end {
        return None;
    }

    let mut out = String::new();
    for (idx, text) in lines[start..end].iter().enumerate() {
        let number = start + idx + 1;
        let marker = if number == line { ">>>" } else { "   " };
        out.push_str(&format!("{marker} {number:4}: {text}\n"));
    }
    Some(out.trim_end().to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────────
