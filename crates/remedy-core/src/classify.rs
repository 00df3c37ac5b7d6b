use crate::types::{Category, Severity};

/// What the engine needs to know about an error type before scheduling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: Category,
    pub severity: Severity,
    pub auto_fixable: bool,
    pub requires_restart: bool,
}

const fn class(
    category: Category,
    severity: Severity,
    auto_fixable: bool,
    requires_restart: bool,
) -> Classification {
    Classification {
        category,
        severity,
        auto_fixable,
        requires_restart,
    }
}

/// Classify an error type. Total: unknown types fall into the Python
/// bucket as high-severity, fixable, restart-requiring — unclassified
/// errors are handled, never dropped.
pub fn classify(error_type: &str) -> Classification {
    use Category::*;
    use Severity::*;

    match error_type {
        // Python errors — code-level, fixable, need a reload to take effect
        "ImportError" => class(Python, High, true, true),
        "SyntaxError" => class(Python, Critical, true, true),
        "IndentationError" => class(Python, Critical, true, true),
        "AttributeError" => class(Python, High, true, true),
        "TypeError" => class(Python, High, true, true),
        "NameError" => class(Python, High, true, true),
        "ValueError" => class(Python, Medium, true, true),
        "KeyError" => class(Python, Medium, true, true),

        // Missing dependencies need an install plus restart
        "ModuleNotFoundError" => class(Dependency, High, true, true),

        // Database-driver failures are operational, not code bugs
        "psycopg2.OperationalError" => class(Database, Critical, false, false),
        "psycopg2.IntegrityError" => class(Database, High, false, false),
        "psycopg2.ProgrammingError" => class(Database, High, true, false),

        // Framework exceptions surface at request time; no restart needed
        "ValidationError" => class(Odoo, Medium, true, false),
        "UserError" => class(Odoo, Low, false, false),
        "AccessError" => class(Odoo, Medium, false, false),
        "MissingError" => class(Odoo, Medium, true, false),
        "ParseError" => class(Odoo, High, true, true),

        // Asset pipeline errors rebuild on the fly
        "JavaScriptError" => class(Asset, Medium, true, false),
        "SCSSCompilation" => class(Asset, Medium, true, false),
        "AssetError" => class(Asset, Medium, true, false),

        // Safe default for anything unrecognized
        _ => class(Python, High, true, true),
    }
}
