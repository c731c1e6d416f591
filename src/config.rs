use crate::extract::is_known_layout;
use crate::model::Resource;
use anyhow::{Context, Result, anyhow, bail};
use scraper::Selector;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_API_KEY_ENV: &str = "GEOCODE_API_KEY";

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub source: SourceMeta,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub geocode: GeocodeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source.key.trim().is_empty() {
            bail!("source.key must not be empty");
        }
        if self.source.name.trim().is_empty() {
            bail!("source.name must not be empty");
        }

        match self.fetch.mode {
            FetchMode::Http => {
                let url = self
                    .fetch
                    .url
                    .as_ref()
                    .context("fetch.url is required for http mode")?;
                Url::parse(url).with_context(|| format!("invalid fetch.url {url}"))?;
            }
            FetchMode::File => {
                if self.fetch.file_path.is_none() {
                    bail!("fetch.file_path is required for file mode");
                }
            }
            FetchMode::Inline => {
                if self.fetch.inline_data.is_none() {
                    bail!("fetch.inline_data is required for inline mode");
                }
            }
        }

        if !is_known_layout(&self.extract.layout) {
            bail!("unknown extract.layout {}", self.extract.layout);
        }
        if let Some(selector) = &self.extract.row_selector {
            Selector::parse(selector)
                .map_err(|err| anyhow!("invalid extract.row_selector {selector}: {err:?}"))?;
        }

        Url::parse(&self.geocode.endpoint)
            .with_context(|| format!("invalid geocode.endpoint {}", self.geocode.endpoint))?;
        if self.geocode.api_key_env.trim().is_empty() {
            bail!("geocode.api_key_env must not be empty");
        }
        if self.geocode.max_concurrency == 0 {
            bail!("geocode.max_concurrency must be at least 1");
        }

        for resource in &self.resources {
            Url::parse(&resource.url)
                .with_context(|| format!("invalid resource url {}", resource.url))?;
        }

        Ok(())
    }

    /// Attribution entries for the display layer. Falls back to the fetched
    /// page itself when none are configured.
    pub fn resources(&self) -> Vec<Resource> {
        if !self.resources.is_empty() {
            return self.resources.clone();
        }
        match (&self.fetch.mode, &self.fetch.url) {
            (FetchMode::Http, Some(url)) => vec![Resource {
                name: self.source.name.clone(),
                url: url.clone(),
            }],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMeta {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Http,
    File,
    Inline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub mode: FetchMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub inline_data: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: FetchMode::Http,
            url: None,
            file_path: None,
            inline_data: None,
            headers: BTreeMap::new(),
            timeout_secs: default_fetch_timeout_secs(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_layout")]
    pub layout: String,
    #[serde(default)]
    pub row_selector: Option<String>,
    #[serde(default)]
    pub allow_empty: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            layout: default_layout(),
            row_selector: None,
            allow_empty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// One failed lookup fails the whole batch.
    #[default]
    Abort,
    /// A failed lookup leaves its record unresolved.
    Isolate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeConfig {
    #[serde(default = "default_geocode_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_geocode_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub on_lookup_failure: FailurePolicy,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_geocode_endpoint(),
            api_key_env: default_api_key_env(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_geocode_timeout_secs(),
            on_lookup_failure: FailurePolicy::Abort,
            user_agent: None,
        }
    }
}

impl GeocodeConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        let key = std::env::var(&self.api_key_env)
            .with_context(|| format!("geocoding api key not set; export {}", self.api_key_env))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("environment variable {} is empty", self.api_key_env);
        }
        Ok(key.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

pub fn load_config(config_path: &Path) -> Result<LoadedConfig> {
    let text = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read pipeline config: {}", config_path.display()))?;
    let config: PipelineConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse toml in {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid pipeline config {}", config_path.display()))?;
    Ok(LoadedConfig {
        path: config_path.to_path_buf(),
        config,
    })
}

pub fn resolve_path(base_config_path: &Path, maybe_relative: &Path) -> Result<PathBuf> {
    if maybe_relative.is_absolute() {
        return Ok(maybe_relative.to_path_buf());
    }

    let parent = base_config_path.parent().ok_or_else(|| {
        anyhow!(
            "pipeline config has no parent directory: {}",
            base_config_path.display()
        )
    })?;

    Ok(parent.join(maybe_relative))
}

fn default_true() -> bool {
    true
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_layout() -> String {
    "kvhh_practice_table_v1".to_string()
}

fn default_geocode_endpoint() -> String {
    DEFAULT_GEOCODE_ENDPOINT.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_geocode_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}
