//! Engine configuration
//!
//! Loaded in layers: built-in defaults, then an optional file (format by
//! extension), then `APPROVALS_*` environment variables. Nested keys use a
//! double underscore, e.g. `APPROVALS_TASKS__DUE_OFFSET_HOURS=24`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Task orchestration
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Permission pass tuning
    #[serde(default)]
    pub permissions: PermissionConfig,

    /// Read-side defaults
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration (applied by the embedding binary)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Task orchestration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Due date offset from stage entry, in hours
    #[serde(default = "default_due_offset_hours")]
    pub due_offset_hours: u64,

    /// Bucket new task cards are placed in
    #[serde(default = "default_backlog_bucket")]
    pub backlog_bucket: String,

    /// Bucket closed task cards are moved to
    #[serde(default = "default_done_bucket")]
    pub done_bucket: String,

    /// Notify the new assignee on reassignment
    #[serde(default = "default_true")]
    pub notify_on_reassign: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            due_offset_hours: default_due_offset_hours(),
            backlog_bucket: default_backlog_bucket(),
            done_bucket: default_done_bucket(),
            notify_on_reassign: true,
        }
    }
}

/// Permission configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Minimum role level satisfying a `supervisor` token
    #[serde(default = "default_supervisor_level")]
    pub supervisor_level: u8,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            supervisor_level: default_supervisor_level(),
        }
    }
}

/// Query configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_overdue_threshold_hours")]
    pub overdue_threshold_hours: u64,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            overdue_threshold_hours: default_overdue_threshold_hours(),
            default_page_size: default_page_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_due_offset_hours() -> u64 {
    48
}

fn default_backlog_bucket() -> String {
    "backlog".to_string()
}

fn default_done_bucket() -> String {
    "done".to_string()
}

fn default_supervisor_level() -> u8 {
    2
}

fn default_overdue_threshold_hours() -> u64 {
    72
}

fn default_page_size() -> usize {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("APPROVALS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.due_offset_hours == 0 {
            return Err(ConfigError::Invalid(
                "tasks.due_offset_hours must be greater than zero".to_string(),
            ));
        }
        let backlog = self.tasks.backlog_bucket.trim();
        let done = self.tasks.done_bucket.trim();
        if backlog.is_empty() || done.is_empty() {
            return Err(ConfigError::Invalid(
                "task buckets must not be empty".to_string(),
            ));
        }
        if backlog == done {
            return Err(ConfigError::Invalid(format!(
                "backlog and done buckets must differ (both '{backlog}')"
            )));
        }
        if self.query.default_page_size == 0 {
            return Err(ConfigError::Invalid(
                "query.default_page_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
