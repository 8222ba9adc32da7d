use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use crate::audio::OutputFormat;
use crate::constants::worker::MAX_WORKERS_LIMIT;
use crate::voice::Voice;

/// User settings persisted in `~/.tts-batch/settings.yaml`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub voice: Voice,
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    #[serde(default = "default_price_per_thousand_chars")]
    pub price_per_thousand_chars: f64,
    #[serde(default)]
    pub keep_parts: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_save_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_price_per_thousand_chars() -> f64 {
    0.015 // tts-1 list price in USD
}

fn default_model() -> String {
    "tts-1".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    120 // a 4000 character segment can take over a minute to render
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_key: String::new(),
            voice: Voice::default(),
            save_path: default_save_path(),
            price_per_thousand_chars: default_price_per_thousand_chars(),
            keep_parts: false,
            output_format: OutputFormat::default(),
            model: default_model(),
            max_workers: default_max_workers(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".tts-batch"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.yaml"))
    }

    /// Load settings from the default location, falling back to defaults if the file is absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;

        // An empty file deserializes to unit, not to a mapping
        if contents.trim().is_empty() {
            return Ok(Settings::default());
        }

        let settings: Settings = serde_yaml::from_str(&contents)
            .context("Failed to parse settings file")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if !self.price_per_thousand_chars.is_finite() || self.price_per_thousand_chars < 0.0 {
            bail!("price_per_thousand_chars must be a number >= 0.0");
        }

        if self.max_workers == 0 || self.max_workers > MAX_WORKERS_LIMIT {
            bail!("max_workers must be between 1 and {}", MAX_WORKERS_LIMIT);
        }

        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }

        if self.model.trim().is_empty() {
            bail!("model name cannot be empty");
        }

        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context("Failed to create config directory")?;
        }

        let yaml = serde_yaml::to_string(self)
            .context("Failed to serialize settings")?;

        fs::write(path, yaml)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;

        Ok(())
    }

    /// Update a single field by its settings.yaml key
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_key" => self.api_key = value.trim().to_string(),
            "voice" => self.voice = value.parse().map_err(anyhow::Error::msg)?,
            "save_path" => self.save_path = PathBuf::from(value),
            "price_per_thousand_chars" => {
                self.price_per_thousand_chars = value.trim().parse()
                    .with_context(|| format!("'{}' is not a decimal number", value))?;
            }
            "keep_parts" => {
                self.keep_parts = value.trim().parse()
                    .with_context(|| format!("'{}' is not true or false", value))?;
            }
            "output_format" => self.output_format = value.parse().map_err(anyhow::Error::msg)?,
            "model" => self.model = value.trim().to_string(),
            "max_workers" => {
                self.max_workers = value.trim().parse()
                    .with_context(|| format!("'{}' is not a positive integer", value))?;
            }
            "request_timeout_secs" => {
                self.request_timeout_secs = value.trim().parse()
                    .with_context(|| format!("'{}' is not a positive integer", value))?;
            }
            other => bail!("Unknown settings key: {}", other),
        }

        self.validate()
    }

    /// The configured API key, or the `OPENAI_API_KEY` environment variable when unset
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }
        std::env::var(crate::constants::api::API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}
