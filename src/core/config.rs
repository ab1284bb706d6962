use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Everything a run needs to know, passed explicitly into the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub temperature: f32,
    #[serde(with = "duration_secs")]
    pub model_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,
    /// Upper bound on attempts per run, counting the first one.
    pub max_attempts: u32,
    /// Row cap appended as `LIMIT` when generated SQL has none.
    pub default_row_limit: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.0,
            model_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            max_attempts: 3,
            default_row_limit: 50,
        }
    }
}

impl AgentConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("askdb").join("config.toml"))
    }

    /// Load from `path` (which must exist) or from the default location (if
    /// present), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ASKDB_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("ASKDB_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("ASKDB_MAX_ATTEMPTS") {
            self.max_attempts = v
                .parse()
                .with_context(|| format!("ASKDB_MAX_ATTEMPTS is not a number: {}", v))?;
        }
        if let Some(v) = lookup("ASKDB_ROW_LIMIT") {
            self.default_row_limit = v
                .parse()
                .with_context(|| format!("ASKDB_ROW_LIMIT is not a number: {}", v))?;
        }
        if let Some(v) = lookup("ASKDB_MODEL_TIMEOUT_SECS") {
            self.model_timeout = parse_secs("ASKDB_MODEL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("ASKDB_QUERY_TIMEOUT_SECS") {
            self.query_timeout = parse_secs("ASKDB_QUERY_TIMEOUT_SECS", &v)?;
        }
        debug!("Effective config: model={} max_attempts={}", self.model, self.max_attempts);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.default_row_limit == 0 {
            bail!("default_row_limit must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("temperature must be between 0 and 2");
        }
        if self.model_timeout.is_zero() || self.query_timeout.is_zero() {
            bail!("timeouts must be greater than zero");
        }
        url::Url::parse(&self.base_url)
            .with_context(|| format!("invalid base_url: {}", self.base_url))?;
        Ok(())
    }

    /// Credential for the model provider, or an error naming the variable.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("OPENAI_API_KEY is not set (environment or config file api_key)")
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .with_context(|| format!("{} is not a number: {}", name, value))?;
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{} must be a positive number of seconds", name);
    }
    Ok(Duration::from_secs_f64(secs))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
