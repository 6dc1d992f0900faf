pub mod crawl;
pub mod dirbust;
pub mod httpx_probe;
pub mod osint;
pub mod portscan_masscan;
pub mod portscan_naabu;
pub mod portscan_nmap;
pub mod registry;
pub mod subdomain;
pub mod types;
pub mod wafw00f;

pub use registry::PluginRegistry;
pub use types::{Fanout, ParseOutcome, PhaseInput, RawOutput, Stage, ToolAdapter, ToolContext, WorkUnit};
