use super::types::{Stage, ToolAdapter};
use crate::config::EngineConfig;
use crate::core::models::Phase;
use crate::executors::command::CommandRunner;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every tool adapter the engine knows, filtered by `tools.<name>.enabled`.
pub struct PluginRegistry {
    adapters: Vec<Arc<dyn ToolAdapter>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
            // phase 0
            Arc::new(super::osint::WhatWeb),
            Arc::new(super::osint::HttpxTech),
            // phase 1
            Arc::new(super::subdomain::Subfinder),
            Arc::new(super::subdomain::Assetfinder),
            Arc::new(super::subdomain::Findomain),
            Arc::new(super::subdomain::Puredns),
            Arc::new(super::httpx_probe::HttpxHosts),
            // phase 2
            Arc::new(super::portscan_naabu::NaabuPortScan),
            Arc::new(super::portscan_masscan::MasscanPortScan),
            Arc::new(super::portscan_nmap::NmapServiceScan),
            // phase 3
            Arc::new(super::dirbust::Ffuf),
            Arc::new(super::dirbust::Feroxbuster),
            Arc::new(super::dirbust::Dirsearch),
            Arc::new(super::dirbust::Gobuster),
            Arc::new(super::httpx_probe::HttpxPaths),
            // phase 4
            Arc::new(super::crawl::Katana),
            Arc::new(super::crawl::Hakrawler),
            Arc::new(super::crawl::ParamSpider),
            Arc::new(super::crawl::LinkFinder),
            Arc::new(super::crawl::Gauplus),
        ];
        Self { adapters }
    }

    pub fn empty() -> Self {
        Self {
            adapters: Vec::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.retain(|existing| existing.name() != adapter.name());
        self.adapters.push(adapter);
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.adapters.retain(|adapter| {
            let enabled = config.tool_enabled(adapter.name());
            if !enabled {
                tracing::info!("Adapter {} disabled by configuration", adapter.name());
            }
            enabled
        });
        registry
    }

    pub fn for_phase(&self, phase: Phase, stage: Stage) -> Vec<Arc<dyn ToolAdapter>> {
        self.adapters
            .iter()
            .filter(|adapter| adapter.phase() == phase && adapter.stage() == stage)
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.name() == name)
            .cloned()
    }

    /// Enabled adapters whose executable is not available, as
    /// `(adapter, program)` pairs.
    pub fn missing_tools(
        &self,
        config: &EngineConfig,
        runner: &dyn CommandRunner,
    ) -> Vec<(String, String)> {
        self.adapters
            .iter()
            .filter_map(|adapter| {
                let program = config.program_for(adapter.name(), adapter.binary());
                (!runner.is_available(&program)).then(|| (adapter.name().to_string(), program))
            })
            .collect()
    }

    pub fn total_plugins(&self) -> usize {
        self.adapters.len()
    }

    pub fn phase_counts(&self) -> BTreeMap<Phase, usize> {
        let mut counts = BTreeMap::new();
        for adapter in &self.adapters {
            *counts.entry(adapter.phase()).or_insert(0) += 1;
        }
        counts
    }

    pub fn log_plugin_summary(&self) {
        tracing::info!("{} adapters registered", self.total_plugins());
        for (phase, count) in self.phase_counts() {
            tracing::info!("  {}: {}", phase, count);
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, ToolConfig};

    #[test]
    fn every_phase_has_discovery_adapters() {
        let registry = PluginRegistry::new();
        for phase in Phase::ALL {
            assert!(
                !registry.for_phase(phase, Stage::Discover).is_empty(),
                "no discovery adapter for {phase}"
            );
        }
        assert_eq!(registry.for_phase(Phase::Subdomains, Stage::Verify).len(), 1);
        assert_eq!(registry.for_phase(Phase::Ports, Stage::Verify).len(), 1);
        assert_eq!(registry.for_phase(Phase::Directories, Stage::Verify).len(), 1);
    }

    #[test]
    fn adapter_names_are_unique() {
        let registry = PluginRegistry::new();
        let mut names: Vec<&str> = registry.adapters.iter().map(|a| a.name()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn disabled_tools_are_dropped() {
        let mut global = GlobalConfig::default();
        global.tools.insert(
            "masscan".into(),
            ToolConfig {
                enabled: false,
                ..ToolConfig::default()
            },
        );
        let config = EngineConfig::new(global, "out");
        let registry = PluginRegistry::from_config(&config);
        assert!(registry.get("masscan").is_none());
        assert!(registry.get("naabu").is_some());
        assert_eq!(registry.total_plugins(), PluginRegistry::new().total_plugins() - 1);
    }
}
