//! Startup configuration read from the environment.
//!
//! | Variable                      | Default                               |
//! |-------------------------------|---------------------------------------|
//! | `COTBOT_ADDR`                 | `127.0.0.1:8501`                      |
//! | `COTBOT_PROVIDER`             | `openai` (`openai` or `gemini`)       |
//! | `OPENAI_API_KEY`              | unset; calls fail with an auth error  |
//! | `GEMINI_API_KEY`              | unset; calls fail with an auth error  |
//! | `OPENAI_BASE_URL`             | `https://api.openai.com/v1`           |
//! | `GEMINI_BASE_URL`             | generative-language `v1beta` endpoint |
//! | `COTBOT_MODELS`               | provider's default model list         |
//! | `COTBOT_TEMPERATURE`          | `0.7`                                 |
//! | `COTBOT_CHUNK_DELAY_MS`       | `10`                                  |
//! | `COTBOT_CONNECT_TIMEOUT_MS`   | `60000`                               |
//! | `COTBOT_SESSION_TTL_SECS`     | `3600`                                |

use std::env;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::chat::session::{SessionDefaults, validate_temperature};
use crate::llm::{GeminiClient, OpenAiClient, Provider, Upstream, gemini, openai};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8501";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be a non-negative integer")]
    ParseInt(String),

    #[error("{0} must be a number")]
    ParseFloat(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub addr: String,
    pub provider: Provider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub models: Vec<String>,
    pub temperature: f32,
    pub chunk_delay: Duration,
    pub connect_timeout: Duration,
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let provider = match vars.trimmed("COTBOT_PROVIDER") {
            Some(raw) => raw
                .parse::<Provider>()
                .map_err(|e| ConfigError::InvalidConfiguration(format!("COTBOT_PROVIDER: {e}")))?,
            None => Provider::OpenAi,
        };

        let (key_var, url_var, default_url) = match provider {
            Provider::OpenAi => ("OPENAI_API_KEY", "OPENAI_BASE_URL", openai::DEFAULT_BASE_URL),
            Provider::Gemini => ("GEMINI_API_KEY", "GEMINI_BASE_URL", gemini::DEFAULT_BASE_URL),
        };

        let models = vars.list("COTBOT_MODELS", provider.default_models());
        if models.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "COTBOT_MODELS must name at least one model".to_string(),
            ));
        }

        let temperature = vars.f32("COTBOT_TEMPERATURE", 0.7)?;
        validate_temperature(temperature).map_err(|e| {
            ConfigError::InvalidConfiguration(format!("COTBOT_TEMPERATURE: {e}"))
        })?;

        Ok(Self {
            addr: vars.trimmed("COTBOT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            provider,
            api_key: vars.trimmed(key_var),
            base_url: vars.trimmed(url_var).unwrap_or_else(|| default_url.to_string()),
            models,
            temperature,
            chunk_delay: Duration::from_millis(vars.u64("COTBOT_CHUNK_DELAY_MS", 10)?),
            connect_timeout: Duration::from_millis(vars.u64("COTBOT_CONNECT_TIMEOUT_MS", 60_000)?),
            session_ttl: Duration::from_secs(vars.u64("COTBOT_SESSION_TTL_SECS", 3_600)?),
        })
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            provider: self.provider,
            models: self.models.clone(),
            temperature: self.temperature,
        }
    }

    /// Builds the upstream client for the configured provider.
    pub fn upstream(&self) -> Result<Upstream, ConfigError> {
        let upstream = match self.provider {
            Provider::OpenAi => Upstream::Completion(Arc::new(OpenAiClient::new(
                self.base_url.clone(),
                self.api_key.clone(),
                self.connect_timeout,
            )?)),
            Provider::Gemini => Upstream::Generative(Arc::new(GeminiClient::new(
                self.base_url.clone(),
                self.api_key.clone(),
                self.connect_timeout,
            )?)),
        };
        Ok(upstream)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn trimmed(&self, key: &str) -> Option<String> {
        (self.0)(key).and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.trimmed(key) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::ParseInt(key.to_string())),
            None => Ok(default),
        }
    }

    fn f32(&self, key: &str, default: f32) -> Result<f32, ConfigError> {
        match self.trimmed(key) {
            Some(raw) => raw
                .parse::<f32>()
                .map_err(|_| ConfigError::ParseFloat(key.to_string())),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.trimmed(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => default.iter().map(|item| (*item).to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.provider, Provider::OpenAi);
        assert_eq!(config.api_key, None);
        assert_eq!(config.base_url, openai::DEFAULT_BASE_URL);
        assert_eq!(config.models, vec!["gpt-3.5-turbo", "gpt-4"]);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.chunk_delay, Duration::from_millis(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn gemini_reads_its_own_key_and_models() {
        let config = config(&[
            ("COTBOT_PROVIDER", "Gemini"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("GEMINI_API_KEY", " g-key "),
            ("COTBOT_MODELS", "gemini-pro, ,gemini-1.5-flash"),
            ("COTBOT_TEMPERATURE", "0.25"),
        ])
        .unwrap();
        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.api_key.as_deref(), Some("g-key"));
        assert_eq!(config.base_url, gemini::DEFAULT_BASE_URL);
        assert_eq!(config.models, vec!["gemini-pro", "gemini-1.5-flash"]);
        assert_eq!(config.session_defaults().temperature, 0.25);
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = config(&[("OPENAI_API_KEY", "   ")]).unwrap();
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn invalid_values_fail() {
        assert!(matches!(
            config(&[("COTBOT_PROVIDER", "claude")]),
            Err(ConfigError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            config(&[("COTBOT_CHUNK_DELAY_MS", "-1")]),
            Err(ConfigError::ParseInt(key)) if key == "COTBOT_CHUNK_DELAY_MS"
        ));
        assert!(matches!(
            config(&[("COTBOT_TEMPERATURE", "warm")]),
            Err(ConfigError::ParseFloat(_))
        ));
        assert!(matches!(
            config(&[("COTBOT_TEMPERATURE", "1.2")]),
            Err(ConfigError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            config(&[("COTBOT_MODELS", " , ")]),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn upstream_matches_provider() {
        let openai = config(&[]).unwrap().upstream().unwrap();
        assert_eq!(openai.provider(), Provider::OpenAi);
        let gemini = config(&[("COTBOT_PROVIDER", "gemini")]).unwrap().upstream().unwrap();
        assert_eq!(gemini.provider(), Provider::Gemini);
    }
}
