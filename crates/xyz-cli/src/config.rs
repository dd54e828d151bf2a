//! Configuration loading from `~/.xyz/config.toml`.

use crate::cli::IdentityOverrides;
use std::path::{Path, PathBuf};
use tracing::info;
use xyz_types::{NodeConfig, XyzError, XyzResult};

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".xyz")
        .join("config.toml")
}

/// Load the node configuration from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> XyzResult<NodeConfig> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let contents = std::fs::read_to_string(&config_path).map_err(|e| {
        XyzError::Config(format!("Cannot read {}: {e}", config_path.display()))
    })?;
    let config: NodeConfig = toml::from_str(&contents).map_err(|e| {
        XyzError::Config(format!("Invalid config {}: {e}", config_path.display()))
    })?;

    info!(
        path = %config_path.display(),
        node = %config.self_conf.name,
        peers = config.system_conf.microservices.len(),
        "Loaded configuration"
    );
    Ok(config)
}

/// Apply command-line identity flags and check the result.
pub fn apply_overrides(
    mut config: NodeConfig,
    overrides: &IdentityOverrides,
) -> XyzResult<NodeConfig> {
    if let Some(name) = &overrides.name {
        config.self_conf.name = name.clone();
    }
    if let Some(host) = &overrides.host {
        config.self_conf.host = host.clone();
    }
    if let Some(port) = overrides.port {
        config.self_conf.port = port;
    }

    if config.self_conf.name.trim().is_empty() {
        return Err(XyzError::Config("[self].name must not be empty".to_string()));
    }
    if let Some(peer) = config
        .system_conf
        .microservices
        .iter()
        .find(|peer| peer.name.trim().is_empty())
    {
        return Err(XyzError::Config(format!(
            "Microservice at {}:{} has no name",
            peer.host, peer.port
        )));
    }
    Ok(config)
}
