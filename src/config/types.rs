use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// File-level configuration. Every section is optional in TOML and falls back
/// to the defaults below.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub adaptive: AdaptiveConfig,
    pub wildcard: WildcardConfig,
    pub wordlists: WordlistConfig,
    pub scan: ScanConfig,
    /// Per-tool overrides keyed by adapter name (`subfinder`, `httpx-hosts`, ...).
    pub tools: BTreeMap<String, ToolConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Worker pool size outside safe mode.
    pub threads: usize,
    /// Parallel DNS lookups when preparing port scan input.
    pub resolve_concurrency: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            resolve_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub tool_timeout_s: u64,
    pub abort_grace_s: u64,
    pub waf_probe_timeout_s: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool_timeout_s: 1800,
            abort_grace_s: 5,
            waf_probe_timeout_s: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange { min_ms: 0, max_ms: 0 };

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    /// Uniform pick from the range; zero for [`DelayRange::ZERO`].
    pub fn sample(&self) -> Duration {
        if self.is_zero() {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms.max(self.min_ms));
        Duration::from_millis(ms)
    }

    /// `min-max` in seconds, the jitter syntax ffuf and dirsearch accept.
    pub fn as_seconds_span(&self) -> String {
        format!(
            "{}-{}",
            self.min_ms as f64 / 1000.0,
            self.max_ms as f64 / 1000.0
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub safe_concurrency: usize,
    pub safe_delay_ms: DelayRange,
    /// (failed + timed out) / finished ratio that escalates to safe mode mid-phase.
    pub error_ratio_high_water: f64,
    /// Finished runs required in a phase before the error ratio is trusted.
    pub min_samples: usize,
    pub safe_timeout_multiplier: u32,
    /// Wildcard statuses treated as an active block from the target.
    pub block_statuses: Vec<u16>,
    /// Watch each web origin's root page during directory discovery and
    /// escalate when it changes.
    pub health_check: bool,
    pub health_interval_ms: DelayRange,
    pub safe_health_interval_ms: DelayRange,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            safe_concurrency: 2,
            safe_delay_ms: DelayRange {
                min_ms: 500,
                max_ms: 2500,
            },
            error_ratio_high_water: 0.5,
            min_samples: 4,
            safe_timeout_multiplier: 2,
            block_statuses: vec![403, 429],
            health_check: true,
            health_interval_ms: DelayRange {
                min_ms: 5_000,
                max_ms: 15_000,
            },
            safe_health_interval_ms: DelayRange {
                min_ms: 30_000,
                max_ms: 60_000,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WildcardConfig {
    pub dominance_ratio: f64,
    pub min_paths: usize,
    /// Content lengths within this many bytes share a signature.
    pub length_tolerance: u64,
}

impl Default for WildcardConfig {
    fn default() -> Self {
        Self {
            dominance_ratio: 0.6,
            min_paths: 10,
            length_tolerance: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WordlistConfig {
    pub subdomains: PathBuf,
    pub subdomains_small: PathBuf,
    pub directories: PathBuf,
    pub directories_small: PathBuf,
    pub resolvers: PathBuf,
    /// Technology name (lowercase) to a dedicated directory wordlist.
    pub technology: BTreeMap<String, PathBuf>,
}

impl Default for WordlistConfig {
    fn default() -> Self {
        let cms = "/usr/share/seclists/Discovery/Web-Content/CMS";
        let technology = BTreeMap::from([
            (
                "wordpress".to_string(),
                PathBuf::from(format!("{cms}/wordpress.fuzz.txt")),
            ),
            (
                "joomla".to_string(),
                PathBuf::from(format!("{cms}/trickest-cms-wordlist/joomla.txt")),
            ),
            ("drupal".to_string(), PathBuf::from(format!("{cms}/Drupal.txt"))),
            (
                "tomcat".to_string(),
                PathBuf::from(format!("{cms}/trickest-cms-wordlist/tomcat.txt")),
            ),
        ]);

        Self {
            subdomains: PathBuf::from(
                "/usr/share/seclists/Discovery/DNS/subdomains-top1million-20000.txt",
            ),
            subdomains_small: PathBuf::from(
                "/usr/share/seclists/Discovery/DNS/subdomains-top1million-5000.txt",
            ),
            directories: PathBuf::from("/usr/share/dirb/wordlists/common.txt"),
            directories_small: PathBuf::from(
                "/usr/share/seclists/Discovery/Web-Content/DirBuster-2007_directory-list-2.3-small.txt",
            ),
            resolvers: PathBuf::from("/usr/local/share/shadowmap/resolvers.txt"),
            technology,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStrategy {
    /// nmap/naabu top ports
    Top,
    /// every TCP port
    All,
    /// `scan.custom_ports`
    Custom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub port_strategy: PortStrategy,
    pub top_ports: u16,
    pub custom_ports: String,
    pub excluded_ports: Vec<u16>,
    pub nmap_scripts: bool,
    pub naabu_rate: u32,
    pub masscan_rate: u32,
    pub puredns_rate: u32,
    pub httpx_rate: u32,
    pub safe_naabu_rate: u32,
    pub safe_masscan_rate: u32,
    pub safe_puredns_rate: u32,
    pub safe_httpx_rate: u32,
    pub safe_http_ports: String,
    pub recursion_depth: u32,
    pub crawl_depth: u32,
    pub max_crawl_seeds: usize,
    pub ignored_extensions: Vec<String>,
    /// Resolve hosts before port scanning so hosts sharing an address are scanned once.
    pub resolve_hosts: bool,
    pub user_agent: String,
}

impl ScanConfig {
    /// Explicit port range for the configured strategy; `None` means the
    /// tool's own top-ports selection.
    pub fn port_range(&self) -> Option<String> {
        match self.port_strategy {
            PortStrategy::Top => None,
            PortStrategy::All => Some("1-65535".to_string()),
            PortStrategy::Custom => Some(self.custom_ports.clone()),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port_strategy: PortStrategy::Top,
            top_ports: 1000,
            custom_ports: String::new(),
            excluded_ports: Vec::new(),
            nmap_scripts: false,
            naabu_rate: 1000,
            masscan_rate: 300,
            puredns_rate: 1000,
            httpx_rate: 150,
            safe_naabu_rate: 100,
            safe_masscan_rate: 100,
            safe_puredns_rate: 50,
            safe_httpx_rate: 10,
            safe_http_ports: "80,443,8000,8080,8443".to_string(),
            recursion_depth: 1,
            crawl_depth: 2,
            max_crawl_seeds: 50,
            ignored_extensions: [
                "png", "jpg", "jpeg", "gif", "svg", "bmp", "ico", "css", "map", "woff", "woff2",
                "ttf", "eot",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            resolve_hosts: true,
            user_agent: format!("shadowmap/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolConfig {
    pub enabled: bool,
    /// Executable to run instead of the adapter's default binary name.
    pub command: Option<String>,
    pub extra_args: Vec<String>,
    pub timeout_s: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            extra_args: Vec::new(),
            timeout_s: None,
        }
    }
}
