//! Run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fingerprint::hash_fields;
use crate::gateway::openai::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::gateway::RetryPolicy;
use crate::prompts::PromptTemplate;

pub const DEFAULT_MODEL: &str = "deepseek-reasoner";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_TEMPERATURE: f32 = 0.6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("API key is missing (set DEEPSEEK_API_KEY or pass one explicitly)")]
    MissingCredential,
    #[error("API key contains non-ASCII characters ({masked}); check for pasted text")]
    NonAsciiCredential { masked: String },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("io error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which outputs a run produces per task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunMode {
    /// One call per task, written to `output`.
    #[default]
    Single,
    /// Two instruction templates, written to `output_before` / `output_after`.
    Compare {
        before: PromptTemplate,
        after: PromptTemplate,
    },
    /// Two instruction templates, written to `output_original` / `output_optimized`.
    Distill {
        original: PromptTemplate,
        optimized: PromptTemplate,
    },
}

/// One call made per task: the output field it fills and the optional
/// template replacing the task instruction.
#[derive(Debug, Clone, Copy)]
pub struct Variant<'a> {
    pub field: &'static str,
    pub template: Option<&'a PromptTemplate>,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Compare { .. } => "compare",
            Self::Distill { .. } => "distill",
        }
    }

    pub fn variants(&self) -> Vec<Variant<'_>> {
        match self {
            Self::Single => vec![Variant {
                field: "output",
                template: None,
            }],
            Self::Compare { before, after } => vec![
                Variant {
                    field: "output_before",
                    template: Some(before),
                },
                Variant {
                    field: "output_after",
                    template: Some(after),
                },
            ],
            Self::Distill {
                original,
                optimized,
            } => vec![
                Variant {
                    field: "output_original",
                    template: Some(original),
                },
                Variant {
                    field: "output_optimized",
                    template: Some(optimized),
                },
            ],
        }
    }
}

/// Everything one run needs. Deserializable from JSON; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub workers: usize,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub mode: RunMode,
    /// Overrides the fingerprint suffix derived from the mode.
    pub fingerprint_suffix: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            input_path: PathBuf::new(),
            output_path: PathBuf::new(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            workers: DEFAULT_WORKERS,
            timeout_seconds: DEFAULT_TIMEOUT.as_secs(),
            temperature: DEFAULT_TEMPERATURE,
            max_attempts: policy.max_attempts,
            retry_base_delay_ms: policy.base_delay.as_millis() as u64,
            mode: RunMode::Single,
            fingerprint_suffix: None,
        }
    }
}

impl RunConfig {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `DEEPSEEK_API_KEY`, `DISTILL_BASE_URL`,
    /// `DISTILL_MODEL`, `DISTILL_WORKERS` and `DISTILL_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a JSON config file. Environment variables are not consulted.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay any set environment variables onto `self`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
            self.api_key = key;
        }
        if let Ok(url) = std::env::var("DISTILL_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(model) = std::env::var("DISTILL_MODEL") {
            self.model = model;
        }
        if let Some(workers) = parse_env("DISTILL_WORKERS")? {
            self.workers = workers;
        }
        if let Some(secs) = parse_env("DISTILL_TIMEOUT_SECONDS")? {
            self.timeout_seconds = secs;
        }
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.max_attempts = policy.max_attempts;
        self.retry_base_delay_ms = policy.base_delay.as_millis() as u64;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fingerprint_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.fingerprint_suffix = Some(suffix.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Suffix used for every fingerprint in this run.
    ///
    /// Single mode defaults to the empty suffix. Comparison modes derive one
    /// from the mode, model and both templates, so editing a template makes
    /// previously finished tasks eligible again.
    pub fn effective_suffix(&self) -> String {
        if let Some(suffix) = &self.fingerprint_suffix {
            return suffix.clone();
        }
        let templates: Vec<&str> = self
            .mode
            .variants()
            .iter()
            .filter_map(|v| v.template.map(|t| t.text.as_str()))
            .collect();
        if templates.is_empty() {
            return String::new();
        }
        let mut fields = vec![self.mode.name(), self.model.as_str()];
        fields.extend(templates);
        let digest = hash_fields(&fields);
        format!("{}-{}", self.mode.name(), &digest[..16])
    }

    /// Structural checks that do not involve credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeout must be at least 1 second".into()));
        }
        if self.input_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("input path is empty".into()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("output path is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model is empty".into()));
        }
        Ok(())
    }

    /// The key must be present and plain ASCII (header-safe).
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(ConfigError::MissingCredential);
        }
        if !key.is_ascii() {
            return Err(ConfigError::NonAsciiCredential {
                masked: mask_key(key),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

/// First and last five characters; everything for short keys is hidden.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{head}...{tail}")
}
