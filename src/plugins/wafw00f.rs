//! One-shot WAF fingerprint taken before phase 0.

use super::types::CommandSpec;
use crate::config::EngineConfig;
use crate::core::models::Target;
use crate::core::policy::WafVerdict;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex"));
static BEHIND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"is behind\s+([^\n(]+)").expect("wafw00f vendor regex"));

pub struct WafProbe;

impl WafProbe {
    pub const NAME: &'static str = "wafw00f";

    pub fn build_invocation(&self, config: &EngineConfig, target: &Target, cwd: &Path) -> CommandSpec {
        let program = config.program_for(Self::NAME, Self::NAME);
        let url = target.base_url();
        let mut spec = CommandSpec::new(program, cwd, config.waf_probe_timeout).arg("-a");
        if let Some(proxy) = &config.proxy {
            spec = spec.opt("-p", proxy.clone());
        }
        spec.args(config.tool(Self::NAME).extra_args).arg(url)
    }

    pub fn parse(&self, stdout: &str) -> WafVerdict {
        let clean = ANSI_RE.replace_all(stdout, "");
        if let Some(caps) = BEHIND_RE.captures(&clean) {
            let vendor = caps[1]
                .trim()
                .trim_end_matches("WAF")
                .trim_end_matches('.')
                .trim()
                .to_string();
            return WafVerdict {
                detected: true,
                vendor: Some(vendor).filter(|v| !v.is_empty()),
                probed: true,
            };
        }
        WafVerdict {
            // generic detection names no vendor
            detected: clean.contains("seems to be behind a WAF"),
            vendor: None,
            probed: true,
        }
    }
}
