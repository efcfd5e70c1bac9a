//! Configuration loading

use anyhow::{Context, Result};
use std::path::Path;

use crate::Config;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "PUSHHUB_CONFIG_PATH";

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. `explicit_path` (the `--config` flag)
/// 2. `PUSHHUB_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// An explicitly requested file that does not exist is an error; the
/// implicit locations are simply skipped.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit_path {
        anyhow::ensure!(Path::new(path).exists(), "Config file {path} does not exist");
    }

    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    // Logging is not initialized yet
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).with_context(|| format!("Failed to load config from {path}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().context("Failed to load config from environment")?
    };

    Ok(config)
}
