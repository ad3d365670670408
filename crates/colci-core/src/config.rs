//! Configuration schema (colci.toml)
//!
//! The configuration is loaded once, optionally overlaid with the `INPUT_*`
//! environment variables a CI action receives, and then passed by value to the
//! orchestrator. Nothing reads process state after that point.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

static PULL_REQUEST_REF: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"refs/pull/(\d+)/merge").ok());

/// SQL dialect configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectConfig {
    /// Generic ANSI SQL
    Ansi,

    /// BigQuery SQL dialect
    BigQuery,

    /// Snowflake SQL dialect
    Snowflake,

    /// PostgreSQL SQL dialect
    Postgres,

    /// Amazon Redshift SQL dialect
    Redshift,

    /// Databricks SQL dialect
    Databricks,

    /// DuckDB SQL dialect
    DuckDb,
}

impl Default for DialectConfig {
    fn default() -> Self {
        Self::Ansi
    }
}

impl DialectConfig {
    /// Parse a dialect name as passed through the environment
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "ansi" | "generic" => Ok(Self::Ansi),
            "bigquery" => Ok(Self::BigQuery),
            "snowflake" => Ok(Self::Snowflake),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redshift" => Ok(Self::Redshift),
            "databricks" | "spark" => Ok(Self::Databricks),
            "duckdb" => Ok(Self::DuckDb),
            other => Err(ConfigError::InvalidValue {
                field: "dialect".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// What the orchestrator does when a node's SQL cannot be classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationFallback {
    /// Treat the node as a node-breaking change (logged and reported)
    Breaking,

    /// Abort the run
    Abort,
}

impl Default for ClassificationFallback {
    fn default() -> Self {
        Self::Breaking
    }
}

/// How downstream consumption of changed columns is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnUsageStrategy {
    /// Parse each downstream node's compiled SQL
    CompiledSql,

    /// Ask the dbt Cloud Discovery API for column lineage
    Discovery,
}

impl Default for ColumnUsageStrategy {
    fn default() -> Self {
        Self::CompiledSql
    }
}

/// Local dbt invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbtConfig {
    /// dbt executable
    pub executable: String,

    /// dbt project directory
    pub project_dir: PathBuf,

    /// Artifact directory, relative to the project directory
    pub target_path: PathBuf,
}

impl Default for DbtConfig {
    fn default() -> Self {
        Self {
            executable: "dbt".to_string(),
            project_dir: PathBuf::from("."),
            target_path: PathBuf::from("target"),
        }
    }
}

impl DbtConfig {
    /// Resolved artifact directory
    pub fn target_dir(&self) -> PathBuf {
        self.project_dir.join(&self.target_path)
    }
}

/// dbt Cloud connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbtCloudConfig {
    /// Account host (e.g., "cloud.getdbt.com")
    pub host: String,

    /// Discovery API host; derived from `host` when absent
    pub metadata_host: Option<String>,

    pub account_id: Option<String>,
    pub project_id: Option<String>,

    /// CI job to trigger
    pub job_id: Option<String>,

    /// Deferring environment; read from the CI job when absent
    pub environment_id: Option<String>,

    /// Service token for the Admin and Discovery APIs
    pub service_token: Option<String>,

    /// Seconds between run status polls
    pub poll_interval_secs: u64,

    /// Give up waiting for the run after this many seconds
    pub timeout_secs: u64,
}

impl Default for DbtCloudConfig {
    fn default() -> Self {
        Self {
            host: "cloud.getdbt.com".to_string(),
            metadata_host: None,
            account_id: None,
            project_id: None,
            job_id: None,
            environment_id: None,
            service_token: None,
            poll_interval_secs: 10,
            timeout_secs: 3600,
        }
    }
}

impl DbtCloudConfig {
    /// Discovery API host (`metadata.<host>` unless overridden)
    pub fn discovery_host(&self) -> String {
        match &self.metadata_host {
            Some(host) => host.clone(),
            None => format!("metadata.{}", self.host),
        }
    }
}

/// GitHub pull request context for PR comments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// Token allowed to comment on the pull request
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// "owner/repo"
    pub repository: Option<String>,

    /// e.g. "refs/pull/42/merge"
    pub git_ref: Option<String>,

    /// Branch under test
    pub head_ref: Option<String>,
}

impl GithubConfig {
    /// Pull request number extracted from `git_ref`
    pub fn pull_request_number(&self) -> Option<u64> {
        let git_ref = self.git_ref.as_deref()?;
        let re = PULL_REQUEST_REF.as_ref()?;
        re.captures(git_ref)?.get(1)?.as_str().parse().ok()
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQL dialect
    #[serde(default)]
    pub dialect: DialectConfig,

    /// Report what would be excluded instead of triggering the job
    #[serde(default)]
    pub dry_run: bool,

    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Policy for unclassifiable SQL
    #[serde(default)]
    pub classification_fallback: ClassificationFallback,

    /// Column usage strategy
    #[serde(default)]
    pub column_usage: ColumnUsageStrategy,

    /// Selector the CI job runs before exclusions
    #[serde(default = "default_base_selector")]
    pub base_selector: String,

    /// Selection criteria whose nodes are never excluded
    #[serde(default)]
    pub always_include: Option<String>,

    /// Local dbt settings
    #[serde(default)]
    pub dbt: DbtConfig,

    /// dbt Cloud settings
    #[serde(default)]
    pub dbt_cloud: DbtCloudConfig,

    /// GitHub settings
    #[serde(default)]
    pub github: GithubConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_selector() -> String {
    "state:modified+".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dialect: DialectConfig::default(),
            dry_run: false,
            log_level: default_log_level(),
            classification_fallback: ClassificationFallback::default(),
            column_usage: ColumnUsageStrategy::default(),
            base_selector: default_base_selector(),
            always_include: None,
            dbt: DbtConfig::default(),
            dbt_cloud: DbtCloudConfig::default(),
            github: GithubConfig::default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Overlay the process environment
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.apply_env(std::env::vars())
    }

    /// Overlay CI action inputs (`INPUT_*`) and GitHub runner variables
    ///
    /// Unknown `INPUT_DBT_CLOUD_*` names are ignored.
    pub fn apply_env<I>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "INPUT_DIALECT" => self.dialect = DialectConfig::parse(&value)?,
                "INPUT_DRY_RUN" => self.dry_run = parse_bool("dry_run", &value)?,
                "INPUT_LOG_LEVEL" => self.log_level = value.to_lowercase(),
                "INPUT_DBT_CLOUD_HOST" => self.dbt_cloud.host = value,
                "INPUT_DBT_CLOUD_SERVICE_TOKEN" => self.dbt_cloud.service_token = Some(value),
                "INPUT_DBT_CLOUD_ACCOUNT_ID" => self.dbt_cloud.account_id = Some(value),
                "INPUT_DBT_CLOUD_PROJECT_ID" => self.dbt_cloud.project_id = Some(value),
                "INPUT_DBT_CLOUD_JOB_ID" => self.dbt_cloud.job_id = Some(value),
                "INPUT_DBT_CLOUD_ENVIRONMENT_ID" => self.dbt_cloud.environment_id = Some(value),
                "INPUT_GITHUB_TOKEN" => self.github.token = Some(value),
                "GITHUB_REPOSITORY" => self.github.repository = Some(value),
                "GITHUB_REF" => self.github.git_ref = Some(value),
                "GITHUB_HEAD_REF" => self.github.head_ref = Some(value),
                _ => {}
            }
        }

        Ok(self)
    }

    /// Check that everything needed to talk to dbt Cloud is present
    ///
    /// Reports all missing fields at once.
    pub fn validate_for_trigger(&self) -> Result<(), ConfigError> {
        let cloud = &self.dbt_cloud;
        let required = [
            ("INPUT_DBT_CLOUD_SERVICE_TOKEN", cloud.service_token.is_some()),
            ("INPUT_DBT_CLOUD_ACCOUNT_ID", cloud.account_id.is_some()),
            ("INPUT_DBT_CLOUD_PROJECT_ID", cloud.project_id.is_some()),
            ("INPUT_DBT_CLOUD_JOB_ID", cloud.job_id.is_some()),
        ];

        let missing: Vec<String> = required
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields(missing))
        }
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value `{value}` for `{field}`")]
    InvalidValue { field: String, value: String },

    #[error("Missing required settings: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.dialect, DialectConfig::Ansi);
        assert_eq!(config.classification_fallback, ClassificationFallback::Breaking);
        assert_eq!(config.base_selector, "state:modified+");
        assert!(!config.dry_run);
    }

    #[test]
    fn parse_toml_sections() {
        let config = Config::from_toml(
            r#"
            dialect = "snowflake"
            dry_run = true
            column_usage = "discovery"
            always_include = "+fct_revenue"

            [dbt_cloud]
            account_id = "43"
            job_id = "567"
            poll_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.dialect, DialectConfig::Snowflake);
        assert!(config.dry_run);
        assert_eq!(config.column_usage, ColumnUsageStrategy::Discovery);
        assert_eq!(config.dbt_cloud.job_id.as_deref(), Some("567"));
        assert_eq!(config.dbt_cloud.poll_interval_secs, 5);
        assert_eq!(config.dbt_cloud.timeout_secs, 3600);
        assert_eq!(config.dbt.executable, "dbt");
    }

    #[test]
    fn env_overlay() {
        let config = Config::default()
            .apply_env(vars(&[
                ("INPUT_DIALECT", "BigQuery"),
                ("INPUT_DRY_RUN", "true"),
                ("INPUT_DBT_CLOUD_JOB_ID", "99"),
                ("INPUT_DBT_CLOUD_UNKNOWN", "ignored"),
                ("GITHUB_REF", "refs/pull/42/merge"),
            ]))
            .unwrap();

        assert_eq!(config.dialect, DialectConfig::BigQuery);
        assert!(config.dry_run);
        assert_eq!(config.dbt_cloud.job_id.as_deref(), Some("99"));
        assert_eq!(config.github.pull_request_number(), Some(42));
    }

    #[test]
    fn invalid_dialect_is_rejected() {
        let err = Config::default()
            .apply_env(vars(&[("INPUT_DIALECT", "oracle")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn missing_trigger_settings_are_listed_together() {
        let err = Config::default().validate_for_trigger().unwrap_err();
        match err {
            ConfigError::MissingFields(fields) => assert_eq!(fields.len(), 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn discovery_host_defaults_to_metadata_subdomain() {
        let cloud = DbtCloudConfig::default();
        assert_eq!(cloud.discovery_host(), "metadata.cloud.getdbt.com");
    }

    #[test]
    fn config_toml_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config.dialect, parsed.dialect);
        assert_eq!(config.base_selector, parsed.base_selector);
    }
}
