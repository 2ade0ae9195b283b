use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TriageError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub folders: FolderConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub business: BusinessConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    #[serde(default = "default_inbox")]
    pub inbox: String,
    /// Worth-keeping messages end up here; never searched
    #[serde(default = "default_archive")]
    pub archive: String,
    #[serde(default = "default_rejected")]
    pub rejected: String,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Primary candidates for backlog sweeps, in search order
    #[serde(default = "default_backlog_folders")]
    pub backlog: Vec<String>,
    /// Tried in order before falling back to flag-and-expunge
    #[serde(default = "default_trash_folders")]
    pub trash: Vec<String>,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            inbox: default_inbox(),
            archive: default_archive(),
            rejected: default_rejected(),
            categories: default_categories(),
            backlog: default_backlog_folders(),
            trash: default_trash_folders(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default = "default_max_messages_per_pass")]
    pub max_messages_per_pass: usize,
    #[serde(default = "default_recent_days")]
    pub recent_days: i64,
    #[serde(default = "default_delete_after_days")]
    pub delete_after_days: i64,
    #[serde(default = "default_true")]
    pub star_kept_messages: bool,
    #[serde(default = "default_true")]
    pub star_on_archive: bool,
    #[serde(default = "default_true")]
    pub mark_rejected_read: bool,
    #[serde(default = "default_true")]
    pub sort_into_category_folders: bool,
    #[serde(default = "default_true")]
    pub category_fallback: bool,
    #[serde(default = "default_message_pacing_ms")]
    pub message_pacing_ms: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_pass_deadline_secs")]
    pub pass_deadline_secs: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            max_messages_per_pass: default_max_messages_per_pass(),
            recent_days: default_recent_days(),
            delete_after_days: default_delete_after_days(),
            star_kept_messages: true,
            star_on_archive: true,
            mark_rejected_read: true,
            sort_into_category_folders: true,
            category_fallback: true,
            message_pacing_ms: default_message_pacing_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            pass_deadline_secs: default_pass_deadline_secs(),
        }
    }
}

impl TriageConfig {
    pub fn message_pacing(&self) -> Duration {
        Duration::from_millis(self.message_pacing_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn pass_deadline(&self) -> Duration {
        Duration::from_secs(self.pass_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Override for OpenAI-compatible endpoints
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base: None,
            max_body_chars: default_max_body_chars(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_marketplace_terms")]
    pub marketplace_terms: Vec<String>,
    #[serde(default = "default_hardware_terms")]
    pub hardware_terms: Vec<String>,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marketplace_terms: default_marketplace_terms(),
            hardware_terms: default_hardware_terms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(
        default = "default_connection_retry",
        deserialize_with = "connection_retry_overrides"
    )]
    pub connection: RetryConfig,
    #[serde(
        default = "default_classifier_retry",
        deserialize_with = "classifier_retry_overrides"
    )]
    pub classifier: RetryConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connection: default_connection_retry(),
            classifier: default_classifier_retry(),
        }
    }
}

/// Bounded retry settings; converted into a `RetryPolicy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub rate_limit_cooldown_ms: u64,
    #[serde(default)]
    pub rate_limit_retries: u32,
    #[serde(default)]
    pub jitter_ratio: f64,
}

/// A `[retry.*]` table as written; missing keys keep that table's defaults
#[derive(Debug, Default, Deserialize)]
struct RetryOverrides {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    attempt_timeout_ms: Option<u64>,
    rate_limit_cooldown_ms: Option<u64>,
    rate_limit_retries: Option<u32>,
    jitter_ratio: Option<f64>,
}

impl RetryOverrides {
    fn apply(self, base: RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            attempt_timeout_ms: self.attempt_timeout_ms.unwrap_or(base.attempt_timeout_ms),
            rate_limit_cooldown_ms: self
                .rate_limit_cooldown_ms
                .unwrap_or(base.rate_limit_cooldown_ms),
            rate_limit_retries: self.rate_limit_retries.unwrap_or(base.rate_limit_retries),
            jitter_ratio: self.jitter_ratio.unwrap_or(base.jitter_ratio),
        }
    }
}

fn connection_retry_overrides<'de, D>(deserializer: D) -> std::result::Result<RetryConfig, D::Error>
where
    D: Deserializer<'de>,
{
    RetryOverrides::deserialize(deserializer).map(|o| o.apply(default_connection_retry()))
}

fn classifier_retry_overrides<'de, D>(deserializer: D) -> std::result::Result<RetryConfig, D::Error>
where
    D: Deserializer<'de>,
{
    RetryOverrides::deserialize(deserializer).map(|o| o.apply(default_classifier_retry()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_burst_delay_ms")]
    pub burst_delay_ms: u64,
    #[serde(default = "default_guard_poll_ms")]
    pub guard_poll_ms: u64,
    #[serde(default = "default_true")]
    pub process_backlog: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            burst_delay_ms: default_burst_delay_ms(),
            guard_poll_ms: default_guard_poll_ms(),
            process_backlog: true,
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn burst_delay(&self) -> Duration {
        Duration::from_millis(self.burst_delay_ms)
    }

    pub fn guard_poll(&self) -> Duration {
        Duration::from_millis(self.guard_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_watermark_path")]
    pub watermark_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            watermark_path: default_watermark_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_inbox() -> String {
    "INBOX".to_string()
}

fn default_archive() -> String {
    "Records".to_string()
}

fn default_rejected() -> String {
    "AI Rejects".to_string()
}

fn default_categories() -> Vec<String> {
    vec![
        "Newsletters".to_string(),
        "Promotions".to_string(),
        "Notifications".to_string(),
        "Receipts".to_string(),
    ]
}

fn default_backlog_folders() -> Vec<String> {
    vec![
        "[Gmail]/All Mail".to_string(),
        "[Google Mail]/All Mail".to_string(),
        "INBOX".to_string(),
    ]
}

fn default_trash_folders() -> Vec<String> {
    vec!["[Gmail]/Trash".to_string(), "[Google Mail]/Trash".to_string()]
}

fn default_max_messages_per_pass() -> usize {
    50
}

fn default_recent_days() -> i64 {
    30
}

fn default_delete_after_days() -> i64 {
    365
}

fn default_message_pacing_ms() -> u64 {
    500
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_pass_deadline_secs() -> u64 {
    1800
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_body_chars() -> usize {
    2000
}

fn default_marketplace_terms() -> Vec<String> {
    [
        "ebay",
        "craigslist",
        "marketplace",
        "offerup",
        "facebook marketplace",
        "letgo",
        "mercari",
        "poshmark",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_hardware_terms() -> Vec<String> {
    [
        "gamepla", "computer", "pc", "thinkpad", "laptop", "desktop", "cpu", "gpu", "ram",
        "hardware", "system", "htpc", "intel", "amd", "nvidia",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_connection_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 10_000,
        attempt_timeout_ms: 60_000,
        rate_limit_cooldown_ms: 0,
        rate_limit_retries: 0,
        jitter_ratio: 0.0,
    }
}

fn default_classifier_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 2_500,
        max_delay_ms: 30_000,
        attempt_timeout_ms: 27_500,
        rate_limit_cooldown_ms: 61_000,
        rate_limit_retries: 10,
        jitter_ratio: 1.0,
    }
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_burst_delay_ms() -> u64 {
    1_000
}

fn default_guard_poll_ms() -> u64 {
    500
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_watermark_path() -> PathBuf {
    PathBuf::from(".mail-triage/last_timestamp.txt")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.folders.inbox.trim().is_empty() {
            return Err(TriageError::Config("folders.inbox cannot be empty".to_string()));
        }
        if self.folders.archive.trim().is_empty() {
            return Err(TriageError::Config("folders.archive cannot be empty".to_string()));
        }
        if self.folders.rejected.trim().is_empty() {
            return Err(TriageError::Config("folders.rejected cannot be empty".to_string()));
        }
        if self.folders.rejected.eq_ignore_ascii_case(&self.folders.archive) {
            return Err(TriageError::Config(
                "folders.rejected cannot be the archive folder".to_string(),
            ));
        }
        for category in &self.folders.categories {
            if category.trim().is_empty() {
                return Err(TriageError::Config(
                    "folders.categories cannot contain empty strings".to_string(),
                ));
            }
        }
        if self.folders.backlog.is_empty() {
            return Err(TriageError::Config(
                "folders.backlog must name at least one folder".to_string(),
            ));
        }

        if self.triage.max_messages_per_pass == 0 {
            return Err(TriageError::Config(
                "triage.max_messages_per_pass must be at least 1".to_string(),
            ));
        }
        if self.triage.recent_days < 0 {
            return Err(TriageError::Config(
                "triage.recent_days cannot be negative".to_string(),
            ));
        }
        if self.triage.delete_after_days < self.triage.recent_days {
            return Err(TriageError::Config(
                "triage.delete_after_days must be at least triage.recent_days".to_string(),
            ));
        }
        if self.triage.operation_timeout_secs == 0 {
            return Err(TriageError::Config(
                "triage.operation_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.triage.pass_deadline_secs == 0 {
            return Err(TriageError::Config(
                "triage.pass_deadline_secs must be greater than 0".to_string(),
            ));
        }

        if self.classifier.max_body_chars == 0 {
            return Err(TriageError::Config(
                "classifier.max_body_chars must be greater than 0".to_string(),
            ));
        }
        if self.classifier.model.trim().is_empty() {
            return Err(TriageError::Config("classifier.model cannot be empty".to_string()));
        }

        for (name, retry) in [
            ("retry.connection", &self.retry.connection),
            ("retry.classifier", &self.retry.classifier),
        ] {
            if retry.max_attempts == 0 {
                return Err(TriageError::Config(format!(
                    "{}.max_attempts must be at least 1",
                    name
                )));
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                return Err(TriageError::Config(format!(
                    "{}.max_delay_ms must be at least base_delay_ms",
                    name
                )));
            }
            if retry.attempt_timeout_ms == 0 {
                return Err(TriageError::Config(format!(
                    "{}.attempt_timeout_ms must be greater than 0",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&retry.jitter_ratio) {
                return Err(TriageError::Config(format!(
                    "{}.jitter_ratio must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if self.scheduler.refresh_interval_secs == 0 {
            return Err(TriageError::Config(
                "scheduler.refresh_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(TriageError::Config("server.port cannot be 0".to_string()));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}

/// Connection parameters; read from the environment, never from the TOML file
#[derive(Clone)]
pub struct MailboxCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: bool,
}

impl std::fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

impl MailboxCredentials {
    pub fn from_env() -> Result<Self> {
        let user = std::env::var("IMAP_USER")
            .map_err(|_| TriageError::Config("IMAP_USER is not set".to_string()))?;
        let password = std::env::var("IMAP_PASSWORD")
            .map_err(|_| TriageError::Config("IMAP_PASSWORD is not set".to_string()))?;
        let host = std::env::var("IMAP_HOST").unwrap_or_else(|_| "imap.gmail.com".to_string());
        let port = match std::env::var("IMAP_PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| {
                TriageError::Config(format!("IMAP_PORT is not a valid port: '{}'", value))
            })?,
            Err(_) => 993,
        };
        let tls = match std::env::var("IMAP_TLS") {
            Ok(value) => !matches!(value.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
            Err(_) => true,
        };

        Ok(Self {
            host,
            port,
            user,
            password,
            tls,
        })
    }
}
