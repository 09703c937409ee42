use crate::chat::broker::{
    ChatDefaults, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TOP_K,
    DEFAULT_TOP_P,
};
use crate::chat::model::DEFAULT_GEMINI_BASE_URL;
use crate::chat::rate_limit::RateLimitConfig;
use crate::chat::types::{GenerationConfig, ModelName, Temperature, TopP};
use crate::error::{Error, Result};
use crate::proxy::service::Maintainer;
use crate::proxy::types::{ProxyConfig, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_REQUEST_SIZE};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub use config::ConfigError;

pub const ENV_PREFIX: &str = "BARE_GATEWAY";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    pub rate_limit: RateLimitSettings,
    pub chat: ChatSettings,
    pub maintenance: MaintenanceSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub maintainer_email: String,
    pub maintainer_website: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub request_timeout_secs: u64,
    pub max_redirects: usize,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub max_request_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub limit: u32,
    pub window_secs: u64,
    pub burst_interval_ms: u64,
    pub burst_threshold: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatSettings {
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub max_history: usize,
    pub conversation_idle_secs: u64,
    pub session_ttl_secs: u64,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub model_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceSettings {
    pub sweep_interval_secs: u64,
    pub failure_backoff_secs: u64,
}

/// Static credential tables for the token identity resolver
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSettings {
    /// Bearer token → user id
    #[serde(default)]
    pub user_tokens: HashMap<String, String>,
    /// Values accepted in `x-api-key` as service credentials
    #[serde(default)]
    pub service_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Settings {
    pub fn new() -> Result<Self> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8080)?
            .set_default("application.environment", environment.clone())?
            .set_default("application.maintainer_email", "")?
            .set_default("application.maintainer_website", "")?
            .set_default("proxy.request_timeout_secs", 30)?
            .set_default("proxy.max_redirects", DEFAULT_MAX_REDIRECTS as i64)?
            .set_default("proxy.cache_enabled", true)?
            .set_default("proxy.cache_ttl_secs", 300)?
            .set_default("proxy.cache_max_entries", 1000)?
            .set_default("proxy.max_request_size", DEFAULT_MAX_REQUEST_SIZE as i64)?
            .set_default("rate_limit.limit", 10)?
            .set_default("rate_limit.window_secs", 60)?
            .set_default("rate_limit.burst_interval_ms", 1000)?
            .set_default("rate_limit.burst_threshold", 5)?
            .set_default("chat.default_model", DEFAULT_MODEL)?
            .set_default("chat.fallback_models", vec!["gemini-1.5-flash", "gemini-pro"])?
            .set_default("chat.temperature", DEFAULT_TEMPERATURE)?
            .set_default("chat.top_k", DEFAULT_TOP_K as i64)?
            .set_default("chat.top_p", DEFAULT_TOP_P)?
            .set_default("chat.max_output_tokens", DEFAULT_MAX_OUTPUT_TOKENS as i64)?
            .set_default("chat.max_history", 10)?
            .set_default("chat.conversation_idle_secs", 7 * 24 * 60 * 60)?
            .set_default("chat.session_ttl_secs", 60 * 60)?
            .set_default("chat.gemini_api_key", "")?
            .set_default("chat.gemini_base_url", DEFAULT_GEMINI_BASE_URL)?
            .set_default("chat.model_timeout_secs", 60)?
            .set_default("maintenance.sweep_interval_secs", 30 * 60)?
            .set_default("maintenance.failure_backoff_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("chat.fallback_models")
                    .with_list_parse_key("auth.service_keys")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make a background loop or window degenerate
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("maintenance.sweep_interval_secs", self.maintenance.sweep_interval_secs),
            ("maintenance.failure_backoff_secs", self.maintenance.failure_backoff_secs),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(Error::invalid_setting(key, "must be greater than zero")),
            None => Ok(()),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    pub fn maintainer(&self) -> Maintainer {
        Maintainer {
            email: self.application.maintainer_email.clone(),
            website: self.application.maintainer_website.clone(),
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
            max_redirects: self.proxy.max_redirects,
            cache_enabled: self.proxy.cache_enabled,
            cache_ttl: Duration::from_secs(self.proxy.cache_ttl_secs),
            cache_max_entries: self.proxy.cache_max_entries,
            max_request_size: self.proxy.max_request_size,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            limit: self.rate_limit.limit,
            window: Duration::from_secs(self.rate_limit.window_secs),
            burst_interval: Duration::from_millis(self.rate_limit.burst_interval_ms),
            burst_threshold: self.rate_limit.burst_threshold,
        }
    }

    /// Chat defaults, validated the same way request overrides are
    pub fn chat_defaults(&self) -> Result<ChatDefaults> {
        let chat = &self.chat;
        let model_name = |name: &str| {
            ModelName::try_new(name).map_err(|e| Error::invalid_setting("chat.default_model", e))
        };

        let fallback_models = chat
            .fallback_models
            .iter()
            .map(|name| {
                ModelName::try_new(name.as_str())
                    .map_err(|e| Error::invalid_setting("chat.fallback_models", e))
            })
            .collect::<Result<Vec<_>>>()?;
        let temperature = Temperature::try_new(chat.temperature)
            .map_err(|e| Error::invalid_setting("chat.temperature", e))?;
        let top_p =
            TopP::try_new(chat.top_p).map_err(|e| Error::invalid_setting("chat.top_p", e))?;

        Ok(ChatDefaults {
            model: model_name(&chat.default_model)?,
            fallback_models,
            generation: GenerationConfig::new(
                temperature,
                chat.top_k,
                top_p,
                chat.max_output_tokens,
            ),
            system_prompt: chat.system_prompt.clone().filter(|p| !p.trim().is_empty()),
        })
    }
}
