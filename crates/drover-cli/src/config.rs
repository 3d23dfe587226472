//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use drover_store::config::DbConfig;

/// Default bind address for the agent-facing router transport.
pub const DEFAULT_ROUTER_BIND: &str = "0.0.0.0:5555";

/// Default bind address for the monitoring HTTP API.
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub router_bind: String,
    pub http_bind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Shared secrets accepted from agent hellos. Usually one; more during
    /// key rotation.
    pub api_keys: Vec<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// API key generation
// -----------------------------------------------------------------------

/// Generate a random API key: 32 random bytes, hex-encoded (64 chars).
pub fn generate_api_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub db_config: DbConfig,
    pub router_bind: String,
    pub http_bind: String,
    pub api_keys: Vec<String>,
}

/// CLI-level overrides fed into [`DroverConfig::resolve`].
#[derive(Debug, Default)]
pub struct Overrides<'a> {
    pub database_url: Option<&'a str>,
    pub router_bind: Option<&'a str>,
    pub http_bind: Option<&'a str>,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: flag > `DROVER_DATABASE_URL` > `database.url` > [`DbConfig::DEFAULT_URL`]
    /// - Router bind: flag > `DROVER_ROUTER_BIND` > `server.router_bind` > [`DEFAULT_ROUTER_BIND`]
    /// - HTTP bind: flag > `DROVER_HTTP_BIND` > `server.http_bind` > [`DEFAULT_HTTP_BIND`]
    /// - API keys: `DROVER_API_KEY` (single key) > `auth.api_keys` > error
    pub fn resolve(overrides: Overrides<'_>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = overrides.database_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("DROVER_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };

        let router_bind = if let Some(bind) = overrides.router_bind {
            bind.to_owned()
        } else if let Ok(bind) = std::env::var("DROVER_ROUTER_BIND") {
            bind
        } else if let Some(ref cfg) = file_config {
            cfg.server.router_bind.clone()
        } else {
            DEFAULT_ROUTER_BIND.to_owned()
        };

        let http_bind = if let Some(bind) = overrides.http_bind {
            bind.to_owned()
        } else if let Ok(bind) = std::env::var("DROVER_HTTP_BIND") {
            bind
        } else if let Some(ref cfg) = file_config {
            cfg.server.http_bind.clone()
        } else {
            DEFAULT_HTTP_BIND.to_owned()
        };

        let api_keys = if let Ok(key) = std::env::var("DROVER_API_KEY") {
            vec![key]
        } else if let Some(ref cfg) = file_config {
            cfg.auth.api_keys.clone()
        } else {
            bail!(
                "no API keys configured; set DROVER_API_KEY or run `drover init` to create a config file"
            );
        };
        if api_keys.is_empty() || api_keys.iter().any(String::is_empty) {
            bail!("auth.api_keys must contain at least one non-empty key");
        }

        Ok(Self {
            db_config: DbConfig::new(db_url),
            router_bind,
            http_bind,
            api_keys,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
