//! CLI configuration handling.
//!
//! Configuration lives in `config.toml` under the platform config directory
//! (`~/.config/ledgerlink/config.toml` on Linux):
//!
//! ```toml
//! log_level = "info"
//!
//! [client]
//! sandbox = true
//! client_id = "AB..."
//! redirect_uri = "https://app.example.com/quickbooks/callback"
//! ```
//!
//! Secrets may be kept out of the file and supplied through
//! `LEDGERLINK_CLIENT_ID`, `LEDGERLINK_CLIENT_SECRET` and
//! `LEDGERLINK_WEBHOOK_SECRET`; environment values win over the file.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use ledgerlink_core::ClientConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variables and the `[client]` keys they override.
const ENV_OVERRIDES: [(&str, &str); 3] = [
    ("LEDGERLINK_CLIENT_ID", "client_id"),
    ("LEDGERLINK_CLIENT_SECRET", "client_secret"),
    ("LEDGERLINK_WEBHOOK_SECRET", "webhook_secret"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Logging level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Credentials file; defaults to the platform data directory.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// QuickBooks app registration.
    pub client: ClientConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default location of `config.toml`.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("ledgerlink.toml"))
}

/// Load configuration from `path` (or the default location) and the
/// process environment.
pub fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let contents = if config_path.exists() {
        std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?
    } else if path.is_some() {
        anyhow::bail!("Config file {:?} does not exist", config_path);
    } else {
        String::new()
    };

    let mut config = parse_config(&contents, |var| std::env::var(var).ok())
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.config_path = config_path;

    Ok(config)
}

/// Parse configuration text, applying overrides from `env`.
pub fn parse_config(contents: &str, env: impl Fn(&str) -> Option<String>) -> Result<CliConfig> {
    let mut table: toml::Table = toml::from_str(contents).context("Invalid TOML")?;

    let client = table
        .entry("client")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(client) = client else {
        anyhow::bail!("`client` must be a table");
    };
    for (var, key) in ENV_OVERRIDES {
        if let Some(value) = env(var).filter(|v| !v.is_empty()) {
            client.insert(key.to_string(), toml::Value::String(value));
        }
    }

    let config: CliConfig = toml::Value::Table(table)
        .try_into()
        .context("Invalid configuration")?;
    config
        .client
        .validate()
        .context("Invalid [client] configuration")?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "ledgerlink", "ledgerlink")
}
