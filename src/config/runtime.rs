use super::types::{
    AdaptiveConfig, GlobalConfig, ScanConfig, ToolConfig, WildcardConfig, WordlistConfig,
};
use crate::cli::args::Cli;
use crate::core::errors::EngineError;
use crate::core::models::Phase;
use crate::core::scope::{self, ExclusionSet};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved, read-only configuration for one engine invocation.
///
/// Built once from the file layer and the command line; the engine only ever
/// sees it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub targets: Vec<String>,
    pub output_dir: PathBuf,
    pub exclusions: Vec<String>,
    pub safe_mode: bool,
    pub proxy: Option<String>,
    /// Phases to run, sorted. Never empty.
    pub phases: Vec<Phase>,
    pub quiet: bool,
    pub waf_probe: bool,
    pub threads: usize,
    pub resolve_concurrency: usize,
    pub tool_timeout: Duration,
    pub abort_grace: Duration,
    pub waf_probe_timeout: Duration,
    pub adaptive: AdaptiveConfig,
    pub wildcard: WildcardConfig,
    pub wordlists: WordlistConfig,
    pub scan: ScanConfig,
    pub tools: BTreeMap<String, ToolConfig>,
}

impl EngineConfig {
    /// Configuration with file defaults and no targets; callers fill in the rest.
    pub fn new(global: GlobalConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            targets: Vec::new(),
            output_dir: output_dir.into(),
            exclusions: Vec::new(),
            safe_mode: false,
            proxy: None,
            phases: Phase::ALL.to_vec(),
            quiet: false,
            waf_probe: true,
            threads: global.concurrency.threads,
            resolve_concurrency: global.concurrency.resolve_concurrency.max(1),
            tool_timeout: Duration::from_secs(global.timeouts.tool_timeout_s),
            abort_grace: Duration::from_secs(global.timeouts.abort_grace_s),
            waf_probe_timeout: Duration::from_secs(global.timeouts.waf_probe_timeout_s),
            adaptive: global.adaptive,
            wildcard: global.wildcard,
            wordlists: global.wordlists,
            scan: global.scan,
            tools: global.tools,
        }
    }

    /// Merge the command line over the file layer and validate the result.
    pub fn resolve(global: GlobalConfig, cli: &Cli) -> Result<Self, EngineError> {
        let mut config = Self::new(global, cli.output_dir.clone());

        config.targets = cli.targets.clone();
        if let Some(list) = &cli.target_list {
            let content = std::fs::read_to_string(list).map_err(|e| {
                EngineError::ConfigInvalid(format!("cannot read target list {:?}: {}", list, e))
            })?;
            config.targets.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }

        config.exclusions = cli.exclude.clone();
        config.safe_mode = cli.safe_mode;
        config.proxy = cli.proxy.clone();
        config.quiet = cli.quiet;
        config.waf_probe = !cli.no_waf_probe;
        if cli.no_health_check {
            config.adaptive.health_check = false;
        }

        if !cli.phases.is_empty() {
            let mut phases = cli.phases.clone();
            phases.sort();
            phases.dedup();
            config.phases = phases;
        }
        if let Some(threads) = cli.threads {
            config.threads = threads;
        }
        if let Some(timeout) = cli.timeout {
            config.tool_timeout = Duration::from_secs(timeout);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.targets.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "no targets given (pass TARGET or --target-list)".to_string(),
            ));
        }
        for raw in &self.targets {
            scope::parse_target(raw)?;
        }
        ExclusionSet::new(&self.exclusions)?;

        if self.threads == 0 {
            return Err(EngineError::ConfigInvalid(
                "threads must be greater than 0".to_string(),
            ));
        }
        if self.tool_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid(
                "tool timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            let parsed = url::Url::parse(proxy).map_err(|e| {
                EngineError::ConfigInvalid(format!("invalid proxy '{}': {}", proxy, e))
            })?;
            if parsed.host_str().is_none() {
                return Err(EngineError::ConfigInvalid(format!(
                    "proxy '{}' has no host",
                    proxy
                )));
            }
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(EngineError::ConfigInvalid(
                "output directory cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> ToolConfig {
        self.tools.get(name).cloned().unwrap_or_default()
    }

    pub fn tool_enabled(&self, name: &str) -> bool {
        self.tools.get(name).map(|tool| tool.enabled).unwrap_or(true)
    }

    /// Executable for an adapter, honouring `tools.<name>.command`.
    pub fn program_for(&self, name: &str, default_binary: &str) -> String {
        self.tools
            .get(name)
            .and_then(|tool| tool.command.clone())
            .unwrap_or_else(|| default_binary.to_string())
    }

    /// `host:port` form of the proxy for tools that do not take a URL.
    pub fn proxy_authority(&self) -> Option<String> {
        let proxy = url::Url::parse(self.proxy.as_deref()?).ok()?;
        let host = proxy.host_str()?;
        Some(match proxy.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}
