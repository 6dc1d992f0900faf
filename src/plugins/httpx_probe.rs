//! httpx as the verify stage of phases 1 and 3.

use super::types::{
    CommandSpec, Fanout, ParseOutcome, RawOutput, Stage, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Evidence, Finding, Sourced, normalize_url};
use crate::core::models::Phase;
use crate::core::policy::Policy;
use serde_json::Value;
use std::net::IpAddr;

/// Common httpx batch invocation over the unit's list file.
fn httpx_command(ctx: &ToolContext, policy: &Policy, hosts_mode: bool) -> Result<CommandSpec, EngineError> {
    let scan = &ctx.config.scan;
    let rate = if policy.safe_mode {
        scan.safe_httpx_rate
    } else {
        scan.httpx_rate
    };
    let mut spec = ctx
        .command(policy)
        .opt("-l", ctx.list_file()?)
        .args(["-silent", "-json", "-fc", "404"])
        .opt("-rate-limit", rate.to_string())
        .opt("-threads", policy.tool_threads.max(1).to_string());
    if hosts_mode && policy.safe_mode {
        spec = spec.opt("-p", scan.safe_http_ports.clone());
    }
    for header in policy.headers.for_invocation() {
        spec = spec.opt("-H", header);
    }
    if let Some(proxy) = &ctx.config.proxy {
        spec = spec.opt("-http-proxy", proxy.clone());
    }
    Ok(spec)
}

fn str_field<'a>(entry: &'a Value, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn u64_field(entry: &Value, key: &str) -> Option<u64> {
    entry.get(key).and_then(Value::as_u64)
}

pub struct HttpxHosts;

impl ToolAdapter for HttpxHosts {
    fn name(&self) -> &'static str {
        "httpx-hosts"
    }

    fn binary(&self) -> &'static str {
        "httpx"
    }

    fn phase(&self) -> Phase {
        Phase::Subdomains
    }

    fn stage(&self) -> Stage {
        Stage::Verify
    }

    fn fanout(&self) -> Fanout {
        Fanout::Batch
    }

    fn cost_hint(&self) -> u32 {
        30
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        httpx_command(ctx, policy, true)
    }

    fn parse(&self, raw: &RawOutput, _ctx: &ToolContext) -> ParseOutcome {
        let source = self.name();
        parse_lines(&raw.stdout, |line| {
            let entry: Value = serde_json::from_str(line).ok()?;
            let url = str_field(&entry, "url")?;
            let host = str_field(&entry, "input").unwrap_or(url);
            let mut finding = Finding::subdomain(host, source)?;
            if let Finding::Subdomain(sub) = &mut finding {
                sub.url = normalize_url(url).map(|u| Sourced::new(u, source, Evidence::Verified));
                sub.http_status = u64_field(&entry, "status_code")
                    .and_then(|code| u16::try_from(code).ok())
                    .map(|code| Sourced::new(code, source, Evidence::Verified));
                let address = entry
                    .get("a")
                    .and_then(Value::as_array)
                    .and_then(|addrs| addrs.iter().filter_map(Value::as_str).next())
                    .or_else(|| str_field(&entry, "host"))
                    .and_then(|ip| ip.parse::<IpAddr>().ok());
                sub.resolved_ip = address.map(|ip| Sourced::new(ip, source, Evidence::Verified));
            }
            Some(vec![finding])
        })
    }
}

pub struct HttpxPaths;

impl ToolAdapter for HttpxPaths {
    fn name(&self) -> &'static str {
        "httpx-paths"
    }

    fn binary(&self) -> &'static str {
        "httpx"
    }

    fn phase(&self) -> Phase {
        Phase::Directories
    }

    fn stage(&self) -> Stage {
        Stage::Verify
    }

    fn fanout(&self) -> Fanout {
        Fanout::Batch
    }

    fn cost_hint(&self) -> u32 {
        30
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        httpx_command(ctx, policy, false)
    }

    fn parse(&self, raw: &RawOutput, _ctx: &ToolContext) -> ParseOutcome {
        let source = self.name();
        parse_lines(&raw.stdout, |line| {
            let entry: Value = serde_json::from_str(line).ok()?;
            // `input` keeps the exact URL we asked for, so the identity key matches
            let url = str_field(&entry, "input")
                .filter(|input| input.contains("://"))
                .or_else(|| str_field(&entry, "url"))?;
            let mut finding = Finding::path(url, source)?;
            if let Finding::Path(path) = &mut finding {
                path.status_code = u64_field(&entry, "status_code")
                    .and_then(|code| u16::try_from(code).ok())
                    .map(|code| Sourced::new(code, source, Evidence::Verified));
                path.content_length = u64_field(&entry, "content_length")
                    .map(|len| Sourced::new(len, source, Evidence::Verified));
                path.redirect = str_field(&entry, "location")
                    .map(|loc| Sourced::new(loc.to_string(), source, Evidence::Verified));
            }
            Some(vec![finding])
        })
    }
}
