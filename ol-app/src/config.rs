//! Orderline configuration loader: TOML file, env overrides, validation.

use crate::breaker::RetryPolicy;
use crate::delivery::DeliveryRules;
use crate::pipeline::PipelineSettings;
use crate::worker::WorkerSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderlineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    pub catalog: CatalogConfig,
    pub export: ExportConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub operator: Option<OperatorConfig>,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub clarification: ClarificationConfig,
    #[serde(default)]
    pub delivery: Option<DeliveryRules>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8484".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    128
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".orderline")
        .join("data")
        .join("orderline.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_pop_timeout_seconds")]
    pub pop_timeout_seconds: u64,
    #[serde(default = "default_processing_ttl_seconds")]
    pub processing_ttl_seconds: u64,
    #[serde(default = "default_processed_ttl_seconds")]
    pub processed_ttl_seconds: u64,
    #[serde(default = "default_sending_ttl_seconds")]
    pub sending_ttl_seconds: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_pop_timeout_seconds() -> u64 {
    10
}

fn default_processing_ttl_seconds() -> u64 {
    300
}

fn default_processed_ttl_seconds() -> u64 {
    86_400
}

fn default_sending_ttl_seconds() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            pop_timeout_seconds: default_pop_timeout_seconds(),
            processing_ttl_seconds: default_processing_ttl_seconds(),
            processed_ttl_seconds: default_processed_ttl_seconds(),
            sending_ttl_seconds: default_sending_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_catalog_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

fn default_catalog_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub chat: ChatChannelConfig,
    #[serde(default)]
    pub email: EmailChannelConfig,
    #[serde(default)]
    pub form: FormChannelConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub send_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub send_url: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub send_url: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    pub channel: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakersConfig {
    #[serde(default = "default_llm_failure_threshold")]
    pub llm_failure_threshold: u32,
    #[serde(default = "default_llm_recovery_seconds")]
    pub llm_recovery_seconds: u64,
    #[serde(default = "default_export_failure_threshold")]
    pub export_failure_threshold: u32,
    #[serde(default = "default_export_recovery_seconds")]
    pub export_recovery_seconds: u64,
    #[serde(default = "default_messaging_failure_threshold")]
    pub messaging_failure_threshold: u32,
    #[serde(default = "default_messaging_recovery_seconds")]
    pub messaging_recovery_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

// The LLM path fails fast to protect worker throughput; export tolerates
// more failures and waits longer given its mutating side effects.
fn default_llm_failure_threshold() -> u32 {
    3
}

fn default_llm_recovery_seconds() -> u64 {
    30
}

fn default_export_failure_threshold() -> u32 {
    5
}

fn default_export_recovery_seconds() -> u64 {
    120
}

fn default_messaging_failure_threshold() -> u32 {
    5
}

fn default_messaging_recovery_seconds() -> u64 {
    60
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            llm_failure_threshold: default_llm_failure_threshold(),
            llm_recovery_seconds: default_llm_recovery_seconds(),
            export_failure_threshold: default_export_failure_threshold(),
            export_recovery_seconds: default_export_recovery_seconds(),
            messaging_failure_threshold: default_messaging_failure_threshold(),
            messaging_recovery_seconds: default_messaging_recovery_seconds(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClarificationConfig {
    #[serde(default = "default_chat_ttl_seconds")]
    pub chat_ttl_seconds: u64,
    #[serde(default = "default_mail_ttl_seconds")]
    pub email_ttl_seconds: u64,
    #[serde(default = "default_mail_ttl_seconds")]
    pub form_ttl_seconds: u64,
    #[serde(default = "default_notified_ttl_seconds")]
    pub notified_ttl_seconds: u64,
}

fn default_chat_ttl_seconds() -> u64 {
    3600
}

fn default_mail_ttl_seconds() -> u64 {
    86_400
}

fn default_notified_ttl_seconds() -> u64 {
    7 * 86_400
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            chat_ttl_seconds: default_chat_ttl_seconds(),
            email_ttl_seconds: default_mail_ttl_seconds(),
            form_ttl_seconds: default_mail_ttl_seconds(),
            notified_ttl_seconds: default_notified_ttl_seconds(),
        }
    }
}

impl OrderlineConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.llm.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ORDERLINE_MODEL") {
            if !v.trim().is_empty() {
                self.llm.model = v;
            }
        }
        if let Ok(v) = std::env::var("ORDERLINE_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store.path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("ORDERLINE_CATALOG_URL") {
            if !v.trim().is_empty() {
                self.catalog.url = v;
            }
        }
        if let Ok(v) = std::env::var("ORDERLINE_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model is required");
        }
        if self.llm.api_key.as_deref().unwrap_or("").trim().is_empty() {
            anyhow::bail!("llm.api_key is required (or set OPENAI_API_KEY)");
        }
        if self.catalog.url.trim().is_empty() {
            anyhow::bail!("catalog.url is required");
        }
        if self.export.url.trim().is_empty() {
            anyhow::bail!("export.url is required");
        }
        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be > 0");
        }
        if self.channels.chat.enabled && self.channels.chat.send_url.trim().is_empty() {
            anyhow::bail!("channels.chat.send_url is required when chat is enabled");
        }
        if self.channels.email.enabled && self.channels.email.send_url.trim().is_empty() {
            anyhow::bail!("channels.email.send_url is required when email is enabled");
        }
        if self.channels.form.enabled && self.channels.form.send_url.trim().is_empty() {
            anyhow::bail!("channels.form.send_url is required when form is enabled");
        }
        if !self.channels.chat.enabled && !self.channels.email.enabled && !self.channels.form.enabled
        {
            anyhow::bail!("at least one channel must be enabled");
        }
        if let Some(operator) = &self.operator {
            if !matches!(operator.channel.as_str(), "chat" | "email" | "form") {
                anyhow::bail!(
                    "operator.channel must be one of chat, email, form (got {:?})",
                    operator.channel
                );
            }
        }
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            workers: self.queue.workers,
            max_retries: self.queue.max_retries,
            pop_timeout: Duration::from_secs(self.queue.pop_timeout_seconds),
            processing_ttl: Duration::from_secs(self.queue.processing_ttl_seconds),
            processed_ttl: Duration::from_secs(self.queue.processed_ttl_seconds),
            store_error_backoff: Duration::from_secs(2),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chat_context_ttl: Duration::from_secs(self.clarification.chat_ttl_seconds),
            email_context_ttl: Duration::from_secs(self.clarification.email_ttl_seconds),
            form_context_ttl: Duration::from_secs(self.clarification.form_ttl_seconds),
            notified_ttl: Duration::from_secs(self.clarification.notified_ttl_seconds),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.breakers.retry_max_attempts,
            initial_delay: Duration::from_millis(self.breakers.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.breakers.retry_max_delay_ms),
            multiplier: 2.0,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".orderline").join("config.toml")
}
