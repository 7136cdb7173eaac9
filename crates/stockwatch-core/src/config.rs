//! StockWatch configuration system.
//!
//! Loaded once by the binary and handed to the core as a resolved value.
//! Library code never reads the environment directly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StockWatchError};
use crate::retry::RetryPolicy;
use crate::types::is_plausible_address;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StockWatchConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub calculator: CalculatorConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl StockWatchConfig {
    /// Load config from the default path (~/.stockwatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StockWatchError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| StockWatchError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the StockWatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stockwatch")
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.scheduler.max_concurrent == 0 {
            problems.push("scheduler.max_concurrent must be at least 1".to_string());
        }
        if self.scheduler.tick_interval_secs == 0 {
            problems.push("scheduler.tick_interval_secs must be at least 1".to_string());
        }
        for (name, policy) in [("calculation", &self.retry.calculation), ("mail", &self.retry.mail)] {
            if policy.max_attempts == 0 {
                problems.push(format!("retry.{name}.max_attempts must be at least 1"));
            }
        }
        if self.notifications.admin_recipients.is_empty() {
            problems.push("notifications.admin_recipients is empty".to_string());
        }
        for addr in &self.notifications.admin_recipients {
            if !is_plausible_address(addr) {
                problems.push(format!("invalid admin recipient '{addr}'"));
            }
        }
        if self.smtp.host.trim().is_empty() {
            problems.push("smtp.host is empty".to_string());
        }
        if !is_plausible_address(&self.smtp.from_address) {
            problems.push(format!("invalid smtp.from_address '{}'", self.smtp.from_address));
        }
        if self.calculator.endpoint.trim().is_empty() {
            problems.push("calculator.endpoint is empty".to_string());
        }
        if !matches!(self.store.backend.as_str(), "json" | "sqlite") {
            problems.push(format!(
                "store.backend must be \"json\" or \"sqlite\", got '{}'",
                self.store.backend
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StockWatchError::ConfigValidation(problems.join("; ")))
        }
    }
}

/// SMTP transport security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS from the first byte (port 465).
    Tls,
    /// No encryption. Local relays and tests only.
    None,
}

/// Outgoing mail relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SmtpSecurity,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// Deadline for a single transport attempt.
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_host() -> String { "localhost".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_from_address() -> String { "stockwatch@localhost.localdomain".into() }
fn default_from_name() -> String { "StockWatch".into() }
fn default_smtp_timeout() -> u64 { 30 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            security: SmtpSecurity::default(),
            username: String::new(),
            password: String::new(),
            from_address: default_from_address(),
            from_name: default_from_name(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

impl SmtpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Notification switches and operator recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Global switch for task reports. Operator escalations ignore it.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub admin_recipients: Vec<String>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn bool_true() -> bool { true }
fn default_subject_prefix() -> String { "[StockWatch]".into() }

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_recipients: Vec::new(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Scheduler loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the loop looks for due triggers.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// How often the trigger set is re-synced with the task store.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Upper bound on executions running at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long `shutdown()` waits for in-flight executions.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Write `active = false` for tasks that fail validation.
    #[serde(default)]
    pub deactivate_invalid_tasks: bool,
}

fn default_tick_interval() -> u64 { 1 }
fn default_reconcile_interval() -> u64 { 60 }
fn default_max_concurrent() -> usize { 4 }
fn default_shutdown_grace() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            max_concurrent: default_max_concurrent(),
            shutdown_grace_secs: default_shutdown_grace(),
            deactivate_invalid_tasks: false,
        }
    }
}

/// Retry policies per dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub calculation: RetryPolicy,
    #[serde(default)]
    pub mail: RetryPolicy,
}

/// Calculation service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatorConfig {
    #[serde(default = "default_calculator_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Deadline for one calculation call.
    #[serde(default = "default_calculator_timeout")]
    pub timeout_secs: u64,
}

fn default_calculator_endpoint() -> String { "http://127.0.0.1:8080/api/availability".into() }
fn default_calculator_timeout() -> u64 { 60 }

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_calculator_endpoint(),
            api_key: String::new(),
            timeout_secs: default_calculator_timeout(),
        }
    }
}

impl CalculatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Where task records live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "json" or "sqlite".
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String { "json".into() }
fn default_store_path() -> String { "~/.stockwatch/tasks".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> StockWatchConfig {
        let mut config = StockWatchConfig::default();
        config.notifications.admin_recipients = vec!["ops@example.com".into()];
        config.smtp.host = "smtp.example.com".into();
        config.smtp.from_address = "stockwatch@example.com".into();
        config
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = StockWatchConfig::from_toml("").unwrap();
        assert!(config.notifications.enabled);
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.security, SmtpSecurity::Starttls);
        assert_eq!(config.retry.mail.max_attempts, 3);
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.store.backend, "json");
    }

    #[test]
    fn test_parse_sections() {
        let config = StockWatchConfig::from_toml(
            r#"
            [smtp]
            host = "mail.example.com"
            port = 465
            security = "tls"
            from_address = "alerts@example.com"

            [notifications]
            enabled = false
            admin_recipients = ["ops@example.com"]

            [retry.calculation]
            max_attempts = 5
            base_delay_ms = 250

            [scheduler]
            max_concurrent = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.smtp.security, SmtpSecurity::Tls);
        assert!(!config.notifications.enabled);
        assert_eq!(config.retry.calculation.max_attempts, 5);
        assert_eq!(config.retry.calculation.base_delay_ms, 250);
        assert_eq!(config.retry.mail.max_attempts, 3);
        assert_eq!(config.scheduler.max_concurrent, 2);
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.notifications.admin_recipients.clear();
        config.scheduler.max_concurrent = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("admin_recipients"));
        assert!(err.contains("max_concurrent"));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = StockWatchConfig::from_toml("[smtp\nport = ").unwrap_err();
        assert!(matches!(err, StockWatchError::Config(_)));
    }
}
