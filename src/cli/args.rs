use crate::core::models::Phase;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "shadowmap",
    version,
    author = "shadowmap",
    about = "Multi-phase reconnaissance orchestrator"
)]
pub struct Cli {
    /// Target domains or IP addresses
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// File with one target per line
    #[arg(short = 'l', long = "target-list", value_name = "FILE")]
    pub target_list: Option<PathBuf>,

    /// Base directory for run output
    #[arg(short = 'o', long = "output-dir", default_value = "shadowmap_reports")]
    pub output_dir: PathBuf,

    /// Exclude hosts matching a glob pattern (repeatable)
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Force safe mode from the start
    #[arg(short = 's', long = "safe-mode", action = ArgAction::SetTrue)]
    pub safe_mode: bool,

    /// Proxy forwarded to tools that support one (e.g. http://127.0.0.1:8080)
    #[arg(long = "proxy")]
    pub proxy: Option<String>,

    /// Run only the given phase (0-4 or name, repeatable)
    #[arg(short = 'p', long = "phase", value_name = "PHASE")]
    pub phases: Vec<Phase>,

    /// Skip the WAF probe at startup
    #[arg(long = "no-waf-probe", action = ArgAction::SetTrue)]
    pub no_waf_probe: bool,

    /// Do not watch web roots for blocking during directory discovery
    #[arg(long = "no-health-check", action = ArgAction::SetTrue)]
    pub no_health_check: bool,

    /// Only print errors and the final report location
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    pub quiet: bool,

    /// Verbose human output
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Debug logs (implies verbose)
    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    pub debug: bool,

    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Worker pool size, overrides the configuration file
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Per-tool timeout in seconds, overrides the configuration file
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout: Option<u64>,
}
