use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::domain::types::{ContextName, ResourceKind};

/// Command-line arguments for the `storefront-cache` binary.
#[derive(Debug, Parser)]
#[command(
    name = "storefront-cache",
    version,
    about = "Shared storefront configuration cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "STOREFRONT_CACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Initialize one context and print what was fetched.
    Warm(WarmArgs),
    /// Print per-resource age, TTL and staleness as JSON.
    Stats,
    /// Drop every cached value and refetch.
    #[command(name = "refresh-all")]
    RefreshAll(RefreshAllArgs),
    /// Print the cached value of one resource as JSON without fetching.
    Show(ShowArgs),
}

#[derive(Debug, Args, Clone)]
pub struct WarmArgs {
    /// Context whose profile is loaded.
    #[arg(long, value_name = "CONTEXT", default_value = "storefront")]
    pub context: ContextName,

    /// Ignore the debounce window and every freshness stamp.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Clone, Default)]
pub struct RefreshAllArgs {
    /// Contexts to re-initialize after the shared profile is refetched.
    #[arg(long = "context", value_name = "CONTEXT")]
    pub contexts: Vec<ContextName>,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    /// Resource kind (theme, banners, footer, homepage_sections, brands, categories, logo, page).
    #[arg(value_name = "KIND")]
    pub kind: ResourceKind,

    /// Site path of the page; required when KIND is `page`.
    #[arg(long, value_name = "PATH")]
    pub page: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the debounce window for repeated initialize calls.
    #[arg(long = "cache-debounce-window-ms", value_name = "MILLIS", global = true)]
    pub cache_debounce_window_ms: Option<u64>,

    /// Override the per-fetch timeout.
    #[arg(long = "cache-fetch-timeout-ms", value_name = "MILLIS", global = true)]
    pub cache_fetch_timeout_ms: Option<u64>,

    /// Override the content API base URL.
    #[arg(long = "provider-base-url", value_name = "URL", global = true)]
    pub provider_base_url: Option<String>,

    /// Override the HTTP client timeout.
    #[arg(long = "provider-timeout-ms", value_name = "MILLIS", global = true)]
    pub provider_timeout_ms: Option<u64>,

    /// Override the directory holding persisted cache entries.
    #[arg(
        long = "storage-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub storage_directory: Option<PathBuf>,

    /// Toggle on-disk persistence.
    #[arg(
        long = "storage-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub storage_enabled: Option<bool>,
}
