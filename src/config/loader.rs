use super::types::{GlobalConfig, PortStrategy};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./shadowmap.toml",
    "./config/shadowmap.toml",
    "/etc/shadowmap/shadowmap.toml",
];

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, preferring an explicit path. An explicit path that
    /// does not exist is an error rather than a silent fallback.
    pub fn load_with_custom_path(custom_path: Option<&Path>) -> Result<GlobalConfig> {
        if let Some(path) = custom_path {
            if !path.exists() {
                anyhow::bail!("Config file does not exist: {:?}", path);
            }
            return Self::load_from_file(path)
                .with_context(|| format!("Failed to load config from custom path: {:?}", path));
        }

        for path in Self::search_paths() {
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from: {:?}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {:#}", path, e);
                        continue;
                    }
                }
            }
        }

        tracing::info!("No configuration file found, using default settings");
        Ok(GlobalConfig::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = DEFAULT_CONFIG_PATHS[..2].iter().map(PathBuf::from).collect();
        if let Some(dirs) = ProjectDirs::from("", "", "shadowmap") {
            paths.push(dirs.config_dir().join("shadowmap.toml"));
        }
        paths.extend(DEFAULT_CONFIG_PATHS[2..].iter().map(PathBuf::from));
        paths
    }

    fn load_from_file(path: &Path) -> Result<GlobalConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: GlobalConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {:?}", path))?;

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate_config(config: &GlobalConfig) -> Result<()> {
        if config.concurrency.threads == 0 {
            anyhow::bail!("concurrency.threads must be greater than 0");
        }

        if config.adaptive.safe_concurrency == 0 {
            anyhow::bail!("adaptive.safe_concurrency must be greater than 0");
        }

        let delay = config.adaptive.safe_delay_ms;
        if delay.min_ms > delay.max_ms {
            anyhow::bail!("adaptive.safe_delay_ms.min_ms must not exceed max_ms");
        }
        if delay.is_zero() {
            anyhow::bail!("adaptive.safe_delay_ms must be a non-zero range");
        }

        for (name, interval) in [
            ("health_interval_ms", config.adaptive.health_interval_ms),
            ("safe_health_interval_ms", config.adaptive.safe_health_interval_ms),
        ] {
            if interval.min_ms > interval.max_ms {
                anyhow::bail!("adaptive.{}.min_ms must not exceed max_ms", name);
            }
        }

        let ratio = config.adaptive.error_ratio_high_water;
        if !(ratio > 0.0 && ratio <= 1.0) {
            anyhow::bail!("adaptive.error_ratio_high_water must be in (0, 1]");
        }

        let dominance = config.wildcard.dominance_ratio;
        if !(dominance > 0.0 && dominance <= 1.0) {
            anyhow::bail!("wildcard.dominance_ratio must be in (0, 1]");
        }

        if config.wildcard.min_paths == 0 {
            anyhow::bail!("wildcard.min_paths must be greater than 0");
        }

        if config.timeouts.tool_timeout_s == 0 {
            anyhow::bail!("timeouts.tool_timeout_s must be greater than 0");
        }

        if config.scan.port_strategy == PortStrategy::Custom
            && config.scan.custom_ports.trim().is_empty()
        {
            anyhow::bail!("scan.custom_ports is required when scan.port_strategy = \"custom\"");
        }

        for (name, tool) in &config.tools {
            if let Some(command) = &tool.command {
                if command.trim().is_empty() {
                    anyhow::bail!("tools.{}.command cannot be empty", name);
                }
            }
            if tool.timeout_s == Some(0) {
                anyhow::bail!("tools.{}.timeout_s must be greater than 0", name);
            }
        }

        Ok(())
    }
}
