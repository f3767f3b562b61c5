//! Configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults, `lattice.toml`,
//! `lattice.<env>.toml`, the conventional unprefixed credential variables and
//! finally `LATTICE_*` env vars. Provides a helper to expand `~` and `${VAR}`
//! in configured paths.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{BackfillTarget, SourceField};

pub const DEFAULT_CONFIG_FILE: &str = "lattice.toml";

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Loads configuration with `path` replacing the default `lattice.toml`.
    /// The default file is optional; an explicit `path` must exist.
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let base = match path {
            Some(path) if !path.is_file() => {
                anyhow::bail!("config file {} not found", path.display())
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let profile = match env_name.as_str() {
            "dev" | "development" => Some("dev.toml"),
            "prod" | "production" => Some("prod.toml"),
            "test" | "testing" => Some("test.toml"),
            _ => None,
        };
        let mut figment = Figment::from(Serialized::defaults(BackfillSettings::default()))
            .merge(Toml::file(&base));
        if let Some(extension) = profile {
            figment = figment.merge(Toml::file(base.with_extension(extension)));
        }
        figment = figment
            .merge(Env::raw().only(&["GEMINI_API_KEY"]).map(|_| "embedding_api_key".into()))
            .merge(Env::raw().only(&["SUPABASE_URL"]).map(|_| "supabase_url".into()))
            .merge(
                Env::raw()
                    .only(&["SUPABASE_SERVICE_ROLE_KEY"])
                    .map(|_| "supabase_service_key".into()),
            )
            .merge(Env::prefixed("LATTICE_"));

        Ok(Self { figment })
    }

    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    pub fn settings(&self) -> anyhow::Result<BackfillSettings> {
        self.figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to read backfill settings: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    /// Deterministic local vectors; no API key needed.
    #[serde(rename = "fake")]
    Fake,
}

/// Everything the backfill binary needs, flattened so env vars map 1:1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub provider: ProviderKind,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: Option<String>,
    pub embedding_dimension: usize,
    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub request_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub page_size: usize,
    pub page_concurrency: usize,
    pub fetch_retry_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub progress_file: String,
    pub targets: Vec<BackfillTarget>,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gemini,
            embedding_model: "gemini-embedding-001".to_string(),
            embedding_api_key: None,
            embedding_base_url: None,
            embedding_dimension: 1536,
            supabase_url: None,
            supabase_service_key: None,
            request_delay_ms: 500,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            page_size: 50,
            page_concurrency: 1,
            fetch_retry_delay_ms: 5000,
            http_timeout_secs: 30,
            progress_file: ".embedding-progress.json".to_string(),
            targets: default_targets(),
        }
    }
}

fn default_targets() -> Vec<BackfillTarget> {
    let fields = || {
        vec![
            SourceField::text("name"),
            SourceField::text("category"),
            SourceField::text("description"),
        ]
    };
    vec![
        BackfillTarget::new("mental_models", "mental_models", fields()),
        BackfillTarget::new("cognitive_biases", "cognitive_biases", fields()),
    ]
}

fn is_blank(value: Option<&String>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

impl BackfillSettings {
    /// Checks the settings needed before any row is touched. Reset and
    /// status commands do not call this.
    pub fn validate(&self) -> Result<()> {
        if self.provider != ProviderKind::Fake && is_blank(self.embedding_api_key.as_ref()) {
            return Err(Error::InvalidConfig("missing embedding API key".into()));
        }
        if is_blank(self.supabase_url.as_ref()) {
            return Err(Error::InvalidConfig("missing Supabase URL".into()));
        }
        if is_blank(self.supabase_service_key.as_ref()) {
            return Err(Error::InvalidConfig("missing Supabase service key".into()));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(Error::InvalidConfig("missing embedding model".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(Error::InvalidConfig("embedding dimension must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("page size must be positive".into()));
        }
        if self.targets.is_empty() {
            return Err(Error::InvalidConfig("no backfill targets configured".into()));
        }
        for target in &self.targets {
            if target.fields.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "target '{}' has no text-source fields",
                    target.name
                )));
            }
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Result<&BackfillTarget> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::NotFound(format!("backfill target '{}'", name)))
    }

    pub fn progress_path(&self) -> PathBuf {
        expand_path(&self.progress_file)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    // Expand ~ at start
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

