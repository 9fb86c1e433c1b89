use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sla: SlaConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Default: ~/.accredit/accredit.db
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// SLA monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    #[serde(default = "default_sla_enabled")]
    pub enabled: bool,
    /// Seconds between two scans.
    #[serde(default = "default_sla_interval")]
    pub interval_secs: u64,
    /// Minutes past the SLA duration after which a warning becomes a breach.
    #[serde(default = "default_breach_grace")]
    pub breach_grace_minutes: u32,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            enabled: default_sla_enabled(),
            interval_secs: default_sla_interval(),
            breach_grace_minutes: default_breach_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// JSONL event journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for journal files. Default: ~/.accredit/journal
    #[serde(default = "default_journal_dir")]
    pub dir: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_journal_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_store_path() -> String { "~/.accredit/accredit.db".to_string() }
fn default_sla_enabled() -> bool { true }
fn default_sla_interval() -> u64 { 300 }
fn default_breach_grace() -> u32 { 60 }
fn default_event_capacity() -> usize { 256 }
fn default_journal_dir() -> String { "~/.accredit/journal".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WorkflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WorkflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.events.capacity == 0 {
            return Err(WorkflowError::Config(
                "events.capacity must be at least 1".to_string(),
            ));
        }
        if self.sla.interval_secs == 0 {
            return Err(WorkflowError::Config(
                "sla.interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    pub fn journal_dir(&self) -> PathBuf {
        expand_home(&self.journal.dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_ACCREDIT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_ACCREDIT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_ACCREDIT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_ACCREDIT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_ACCREDIT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.path, "~/.accredit/accredit.db");
        assert!(config.sla.enabled);
        assert_eq!(config.sla.interval_secs, 300);
        assert_eq!(config.sla.breach_grace_minutes, 60);
        assert_eq!(config.events.capacity, 256);
        assert!(!config.journal.enabled);
        assert!(config.log.filter.is_none());
    }

    #[test]
    fn test_partial_sla_section() {
        let toml_str = r#"
[sla]
interval_secs = 30
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sla.interval_secs, 30);
        assert_eq!(config.sla.breach_grace_minutes, 60);
        assert!(config.sla.enabled);
    }

    #[test]
    fn test_absolute_store_path_untouched() {
        let mut config = AppConfig::default();
        config.store.path = "/var/lib/accredit/db.sqlite".to_string();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/accredit/db.sqlite"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity_and_interval() {
        assert!(AppConfig::default().validate().is_ok());

        let mut config = AppConfig::default();
        config.events.capacity = 0;
        assert!(matches!(config.validate(), Err(WorkflowError::Config(_))));

        let mut config = AppConfig::default();
        config.sla.interval_secs = 0;
        assert!(matches!(config.validate(), Err(WorkflowError::Config(_))));
    }
}
