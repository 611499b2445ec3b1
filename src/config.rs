//! Configuration loading and validation.

use crate::UserRole;
use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level relaybot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance root directory (~/.relaybot or RELAYBOT_DIR).
    pub instance_dir: PathBuf,
    pub llm: LlmConfig,
    pub telegram: TelegramConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    /// Role -> models the role may open chats with.
    pub access: HashMap<UserRole, Vec<String>>,
}

/// Completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    /// Base URL including the `/v1` suffix.
    pub base_url: String,
    /// Limit on connecting and on each read. A stream that keeps producing
    /// data is never cut off.
    pub request_timeout: Duration,
    /// Temperature assigned to newly created chats.
    pub default_temperature: f32,
}

/// Telegram bot settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    /// When false, only users holding one of `available_for_roles` get in.
    pub is_public: bool,
    pub admin_ids: Vec<i64>,
    pub premium_ids: Vec<i64>,
    pub available_for_roles: Vec<UserRole>,
}

/// Streaming pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Context budget in tokens. The prompt history is trimmed below it.
    pub token_budget: usize,
    /// Minimum spacing between non-final message edits.
    pub throttle_window: Duration,
    /// Timeout for request/response handling of one inbound update.
    pub update_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            token_budget: 3500,
            throttle_window: Duration::from_millis(2500),
            update_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redb,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

// -- TOML deserialization types --

#[derive(Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    llm: TomlLlmConfig,
    #[serde(default)]
    telegram: TomlTelegramConfig,
    #[serde(default)]
    pipeline: TomlPipelineConfig,
    #[serde(default)]
    storage: TomlStorageConfig,
    #[serde(default)]
    access: Vec<TomlAccessEntry>,
}

#[derive(Deserialize, Default)]
struct TomlLlmConfig {
    api_key: Option<String>,
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    default_temperature: Option<f32>,
}

#[derive(Deserialize, Default)]
struct TomlTelegramConfig {
    token: Option<String>,
    is_public: Option<bool>,
    #[serde(default)]
    admin_ids: Vec<i64>,
    #[serde(default)]
    premium_ids: Vec<i64>,
    #[serde(default)]
    available_for_roles: Vec<String>,
}

#[derive(Deserialize, Default)]
struct TomlPipelineConfig {
    token_budget: Option<usize>,
    throttle_window_ms: Option<u64>,
    update_timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlStorageConfig {
    backend: Option<String>,
    path: Option<String>,
}

#[derive(Deserialize)]
struct TomlAccessEntry {
    role: String,
    #[serde(default)]
    models: Vec<String>,
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        std::env::var(var_name).ok()
    } else {
        Some(value.to_string())
    }
}

/// Append `/v1` unless the URL already ends with it.
fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

/// Parse a comma-separated list of telegram ids, skipping garbage.
fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|id| {
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            match id.parse::<i64>() {
                Ok(id) => Some(id),
                Err(error) => {
                    tracing::warn!(%error, id, "ignoring malformed telegram id");
                    None
                }
            }
        })
        .collect()
}

fn parse_backend(raw: &str) -> Result<StorageBackend> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "memory" | "in-memory" | "in_memory" => Ok(StorageBackend::Memory),
        "redb" | "key-value" | "kv" => Ok(StorageBackend::Redb),
        other => Err(ConfigError::Invalid {
            key: "storage.backend",
            details: format!("unknown backend '{other}'"),
        }
        .into()),
    }
}

impl Config {
    /// Resolve the instance directory from env or default (~/.relaybot).
    pub fn default_instance_dir() -> PathBuf {
        std::env::var("RELAYBOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|d| d.join(".relaybot"))
                    .unwrap_or_else(|| PathBuf::from("./.relaybot"))
            })
    }

    /// Load configuration from the default config file, falling back to env vars.
    pub fn load() -> Result<Self> {
        let instance_dir = Self::default_instance_dir();

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::load_from_env(&instance_dir)
        }
    }

    /// Load from a specific TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        Self::from_toml_str(&content, instance_dir)
    }

    /// Parse TOML text. Settings missing from the file fall back to env vars.
    pub fn from_toml_str(content: &str, instance_dir: PathBuf) -> Result<Self> {
        let toml_config: TomlConfig =
            toml::from_str(content).with_context(|| "failed to parse config")?;

        Self::from_toml(toml_config, instance_dir)
    }

    /// Load from environment variables only (no config file).
    ///
    /// The role -> model table cannot be expressed in env vars, so every role
    /// gets `OPENAI_MODEL` (default `gpt-4o-mini`).
    pub fn load_from_env(instance_dir: &Path) -> Result<Self> {
        let mut toml_config = TomlConfig::default();

        toml_config.telegram.admin_ids = std::env::var("ADMIN_TELEGRAM_IDS")
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default();
        toml_config.telegram.premium_ids = std::env::var("PREMIUM_TELEGRAM_IDS")
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default();
        toml_config.telegram.is_public = std::env::var("TELEGRAM_IS_PUBLIC")
            .ok()
            .map(|raw| !matches!(raw.trim(), "0" | "false" | "no"));

        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        toml_config.access = ["default", "admin", "premium"]
            .into_iter()
            .map(|role| TomlAccessEntry {
                role: role.into(),
                models: vec![model.clone()],
            })
            .collect();

        Self::from_toml(toml_config, instance_dir.to_path_buf())
    }

    fn from_toml(toml: TomlConfig, instance_dir: PathBuf) -> Result<Self> {
        let api_key = toml
            .llm
            .api_key
            .as_deref()
            .and_then(resolve_env_value)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::Missing("llm.api_key / OPENAI_API_KEY"))?;

        let base_url = toml
            .llm
            .base_url
            .as_deref()
            .and_then(resolve_env_value)
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.into());

        let default_temperature = toml.llm.default_temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&default_temperature) {
            return Err(ConfigError::Invalid {
                key: "llm.default_temperature",
                details: format!("{default_temperature} is outside 0.0..=2.0"),
            }
            .into());
        }

        let llm = LlmConfig {
            api_key,
            base_url: normalize_base_url(&base_url),
            request_timeout: Duration::from_secs(
                toml.llm
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            default_temperature,
        };

        let token = toml
            .telegram
            .token
            .as_deref()
            .and_then(resolve_env_value)
            .or_else(|| std::env::var("TELEGRAM_API_TOKEN").ok())
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::Missing("telegram.token / TELEGRAM_API_TOKEN"))?;

        let telegram = TelegramConfig {
            token,
            is_public: toml.telegram.is_public.unwrap_or(true),
            admin_ids: toml.telegram.admin_ids,
            premium_ids: toml.telegram.premium_ids,
            available_for_roles: toml
                .telegram
                .available_for_roles
                .iter()
                .map(|role| UserRole::parse(role))
                .collect(),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            token_budget: toml.pipeline.token_budget.unwrap_or(defaults.token_budget),
            throttle_window: toml
                .pipeline
                .throttle_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle_window),
            update_timeout: toml
                .pipeline
                .update_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.update_timeout),
        };
        if pipeline.token_budget == 0 {
            return Err(ConfigError::Invalid {
                key: "pipeline.token_budget",
                details: "must be greater than zero".into(),
            }
            .into());
        }

        let backend = match toml.storage.backend.as_deref() {
            Some(raw) => parse_backend(raw)?,
            None => StorageBackend::Redb,
        };
        let storage = StorageConfig {
            backend,
            path: toml
                .storage
                .path
                .map(PathBuf::from)
                .unwrap_or_else(|| instance_dir.join("relaybot.redb")),
        };

        let mut access: HashMap<UserRole, Vec<String>> = HashMap::new();
        for entry in toml.access {
            let models = access.entry(UserRole::parse(&entry.role)).or_default();
            for model in entry.models {
                if !models.contains(&model) {
                    models.push(model);
                }
            }
        }

        Ok(Self {
            instance_dir,
            llm,
            telegram,
            pipeline,
            storage,
            access,
        })
    }
}
