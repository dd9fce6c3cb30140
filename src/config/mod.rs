pub mod types;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::path::Path;
pub use types::*;

/// Looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "mcp-bridge.toml";

/// Prefix of environment overrides, e.g. `MCP_BRIDGE__HTTP__PORT=8080`
pub const ENV_PREFIX: &str = "MCP_BRIDGE";

/// Load configuration from an optional TOML file layered with environment
/// overrides. An explicit `path` must exist; the default file may not.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| match path {
            Some(path) => format!("Failed to load config from: {}", path.display()),
            None => "Failed to load configuration".to_string(),
        })?;

    let app_config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// Validate the loaded configuration
fn validate_config(config: &AppConfig) -> Result<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        anyhow::bail!(
            "Invalid log level '{}'. Valid levels: {}",
            config.logging.level,
            valid_levels.join(", ")
        );
    }

    let valid_formats = ["pretty", "json"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        anyhow::bail!(
            "Invalid log format '{}'. Valid formats: {}",
            config.logging.format,
            valid_formats.join(", ")
        );
    }

    match &config.provider {
        ProviderConfig::Stdio { command, .. } if command.trim().is_empty() => {
            anyhow::bail!("Stdio provider requires a command");
        }
        ProviderConfig::Http { url }
            if !(url.starts_with("http://") || url.starts_with("https://")) =>
        {
            anyhow::bail!("Provider url '{}' must start with http:// or https://", url);
        }
        _ => {}
    }

    if config.model.base_url.trim().is_empty() {
        anyhow::bail!("Model base_url must not be empty");
    }
    if config.model.api_key_env.trim().is_empty() {
        anyhow::bail!("Model api_key_env must name an environment variable");
    }

    if config.session.handshake_timeout_secs == 0 {
        anyhow::bail!("Session handshake_timeout_secs must be greater than zero");
    }
    if config.http.sse_keep_alive_secs == 0 {
        anyhow::bail!("HTTP sse_keep_alive_secs must be greater than zero");
    }
    if config.server.page_size == Some(0) {
        anyhow::bail!("Server page_size must be greater than zero when set");
    }

    Ok(())
}
