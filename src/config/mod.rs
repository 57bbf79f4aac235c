//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::domain::error::ConfigError;
use crate::domain::types::ResourceKind;

mod cli;

pub use cli::{CliArgs, Command, RefreshAllArgs, SettingsOverrides, ShowArgs, WarmArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "storefront-cache";
const ENV_PREFIX: &str = "STOREFRONT_CACHE";
const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 5_000;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PROVIDER_BASE_URL: &str = "http://127.0.0.1:8000/api/";
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_STORAGE_DIR: &str = ".storefront-cache";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub provider: ProviderSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub debounce_window: Duration,
    pub fetch_timeout: Duration,
    /// TTLs replacing the built-in defaults for the listed kinds.
    pub ttl_overrides: BTreeMap<ResourceKind, Duration>,
    /// Mirrors `storage.enabled`.
    pub persist: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Always ends with `/` so endpoint paths join under it.
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub directory: PathBuf,
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("invalid configuration for `{key}`: {source}")]
    Domain {
        key: String,
        #[source]
        source: ConfigError,
    },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    provider: RawProviderSettings,
    storage: RawStorageSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(window) = overrides.cache_debounce_window_ms {
            self.cache.debounce_window_ms = Some(window);
        }
        if let Some(timeout) = overrides.cache_fetch_timeout_ms {
            self.cache.fetch_timeout_ms = Some(timeout);
        }
        if let Some(url) = overrides.provider_base_url.as_ref() {
            self.provider.base_url = Some(url.clone());
        }
        if let Some(timeout) = overrides.provider_timeout_ms {
            self.provider.timeout_ms = Some(timeout);
        }
        if let Some(directory) = overrides.storage_directory.as_ref() {
            self.storage.directory = Some(directory.clone());
        }
        if let Some(enabled) = overrides.storage_enabled {
            self.storage.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            provider,
            storage,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let storage = build_storage_settings(storage)?;
        let cache = build_cache_settings(cache, storage.enabled)?;
        let provider = build_provider_settings(provider)?;

        Ok(Self {
            logging,
            cache,
            provider,
            storage,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings, persist: bool) -> Result<CacheSettings, LoadError> {
    let debounce_window = non_zero_millis(
        cache.debounce_window_ms.unwrap_or(DEFAULT_DEBOUNCE_WINDOW_MS),
        "cache.debounce_window_ms",
    )?;
    let fetch_timeout = non_zero_millis(
        cache.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
        "cache.fetch_timeout_ms",
    )?;

    let mut ttl_overrides = BTreeMap::new();
    for (name, seconds) in cache.ttl_seconds {
        let key = format!("cache.ttl_seconds.{name}");
        let kind = ResourceKind::from_str(&name).map_err(|source| LoadError::Domain {
            key: key.clone(),
            source,
        })?;
        if seconds == 0 {
            return Err(LoadError::invalid(key, "must be greater than zero"));
        }
        // Policy arithmetic is done in `time::Duration` (i64 seconds).
        if i64::try_from(seconds).is_err() {
            return Err(LoadError::invalid(key, "value exceeds supported range"));
        }
        ttl_overrides.insert(kind, Duration::from_secs(seconds));
    }

    Ok(CacheSettings {
        debounce_window,
        fetch_timeout,
        ttl_overrides,
        persist,
    })
}

fn build_provider_settings(provider: RawProviderSettings) -> Result<ProviderSettings, LoadError> {
    let raw_url = provider
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string());

    let mut base_url = Url::parse(&raw_url).map_err(|err| {
        LoadError::invalid("provider.base_url", format!("invalid URL `{raw_url}`: {err}"))
    })?;
    if base_url.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "provider.base_url",
            format!("`{raw_url}` cannot be used as a base URL"),
        ));
    }
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }

    let timeout = non_zero_millis(
        provider.timeout_ms.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MS),
        "provider.timeout_ms",
    )?;

    Ok(ProviderSettings { base_url, timeout })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let directory = storage
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.directory",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings {
        directory,
        enabled: storage.enabled.unwrap_or(true),
    })
}

fn non_zero_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    debounce_window_ms: Option<u64>,
    fetch_timeout_ms: Option<u64>,
    ttl_seconds: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProviderSettings {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    directory: Option<PathBuf>,
    enabled: Option<bool>,
}
