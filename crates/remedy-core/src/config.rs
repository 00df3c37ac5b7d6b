use std::collections::HashMap;

use anyhow::Result;

use crate::types::RetryPolicy;

/// Full application configuration.
/// All fields come from the environment with `.env` as fallback; nothing
/// here is secret enough to warrant a separate store.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Monitored service
    /// Log file the tailer follows.
    pub log_file: String,
    /// Systemd unit controlled during restarts.
    pub service_name: String,
    /// Health endpoint polled after a restart.
    pub health_url: String,
    /// Root directory handed to the fix agent as its workspace.
    pub workspace_dir: String,
    pub database: String,

    // Tailer / extractor
    pub tail_poll_ms: u64,
    /// Bounded batch channel capacity; a full channel pauses polling.
    pub tail_buffer: usize,
    pub context_lines: usize,

    // Remediation engine
    pub max_concurrent_fixes: usize,
    pub engine_tick_s: u64,
    pub retry_max_attempts: i64,
    pub retry_base_delay_s: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_s: u64,

    // Fix agent
    pub agent_bin: String,
    pub agent_timeout_s: u64,
    pub agent_max_turns: u32,
    pub agent_allowed_tools: String,
    pub model: String,

    // Verifier
    pub stabilization_s: u64,
    pub ready_timeout_s: u64,
    /// Command template for the cheap syntax check; `{file}` is replaced.
    pub syntax_check_cmd: String,

    // Backup
    pub backup_dir: String,
    pub backup_retention_days: i64,
    pub backup_compression: bool,

    // Module updates
    /// Command template run per module; `{module}` and `{database}` are
    /// replaced.
    pub update_cmd: String,
    pub update_timeout_s: u64,

    // Web
    pub web_bind: String,
    pub web_port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Self {
            data_dir: get_str("DATA_DIR", &dotenv, "store"),

            log_file: get_str("LOG_FILE", &dotenv, "/var/log/odoo/odoo.log"),
            service_name: get_str("SERVICE_NAME", &dotenv, "odoo"),
            health_url: get_str(
                "HEALTH_URL",
                &dotenv,
                "http://localhost:8069/web/health",
            ),
            workspace_dir: get_str("WORKSPACE_DIR", &dotenv, "/home/odoo/custom_addons"),
            database: get_str("DATABASE", &dotenv, "odoo"),

            tail_poll_ms: get_u64("TAIL_POLL_MS", &dotenv, 500),
            tail_buffer: get_usize("TAIL_BUFFER", &dotenv, 64),
            context_lines: get_usize("CONTEXT_LINES", &dotenv, 10),

            max_concurrent_fixes: get_usize("MAX_CONCURRENT_FIXES", &dotenv, 5),
            engine_tick_s: get_u64("ENGINE_TICK_S", &dotenv, 5),
            retry_max_attempts: get_i64("RETRY_MAX_ATTEMPTS", &dotenv, 5),
            retry_base_delay_s: get_u64("RETRY_BASE_DELAY_S", &dotenv, 60),
            retry_multiplier: get_f64("RETRY_MULTIPLIER", &dotenv, 2.0),
            retry_max_delay_s: get_u64("RETRY_MAX_DELAY_S", &dotenv, 960),

            agent_bin: get_str("AGENT_BIN", &dotenv, "claude"),
            agent_timeout_s: get_u64("AGENT_TIMEOUT_S", &dotenv, 300),
            agent_max_turns: get_u32("AGENT_MAX_TURNS", &dotenv, 10),
            agent_allowed_tools: get_str(
                "AGENT_ALLOWED_TOOLS",
                &dotenv,
                "Read,Glob,Grep,Edit,Write,Bash",
            ),
            model: get_str("MODEL", &dotenv, "claude-sonnet-4-5"),

            stabilization_s: get_u64("STABILIZATION_S", &dotenv, 30),
            ready_timeout_s: get_u64("READY_TIMEOUT_S", &dotenv, 60),
            syntax_check_cmd: get_str(
                "SYNTAX_CHECK_CMD",
                &dotenv,
                "python -m py_compile {file}",
            ),

            backup_dir: get_str("BACKUP_DIR", &dotenv, "/var/backups/odoo"),
            backup_retention_days: get_i64("BACKUP_RETENTION_DAYS", &dotenv, 7),
            backup_compression: get_bool("BACKUP_COMPRESSION", &dotenv, true),

            update_cmd: get_str(
                "UPDATE_CMD",
                &dotenv,
                "odoo -d {database} -u {module} --stop-after-init --no-http",
            ),
            update_timeout_s: get_u64("UPDATE_TIMEOUT_S", &dotenv, 300),

            web_bind: get_str("WEB_BIND", &dotenv, "0.0.0.0"),
            web_port: get_u16("WEB_PORT", &dotenv, 8000),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay_s: self.retry_base_delay_s,
            multiplier: self.retry_multiplier,
            max_delay_s: self.retry_max_delay_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Keys deliberately not set in the test environment.
        let config = Config::from_env().unwrap();
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_base_delay_s, 60);
        assert_eq!(config.retry_max_delay_s, 960);
        assert_eq!(config.agent_timeout_s, 300);
        assert_eq!(config.stabilization_s, 30);
        assert_eq!(config.max_concurrent_fixes, 5);
        assert_eq!(config.context_lines, 10);
    }

    #[test]
    fn retry_policy_mirrors_fields() {
        let config = Config::from_env().unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, config.retry_max_attempts);
        assert_eq!(policy.delay_before(2), config.retry_base_delay_s);
    }
}
