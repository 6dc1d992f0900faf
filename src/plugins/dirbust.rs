//! Phase 3 discovery: directory brute forcing against web base URLs.
//!
//! Each adapter runs once per base URL. Dominant wildcard signatures already
//! published by the controller are passed to the tool as filters.

use super::types::{
    CommandSpec, ParseOutcome, PhaseInput, RawOutput, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Evidence, Finding, Sourced, parse_url};
use crate::core::models::Phase;
use crate::core::policy::{Policy, ResponseFilter, WordlistTier};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;

static DIRSEARCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s+(\d{3})\s+-\s+(\d+(?:\.\d+)?)([KMG]?B)\s+-\s+(\S+)(?:\s+->\s+(\S+))?")
        .expect("dirsearch regex")
});
static GOBUSTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+)\s+\(Status:\s*(\d{3})\)(?:\s+\[Size:\s*(\d+)\])?(?:\s+\[-->\s*(\S+)\])?")
        .expect("gobuster regex")
});

/// Technology-specific list when phase 0 found a matching technology and the
/// file exists, otherwise the list for the policy's tier.
fn wordlist(ctx: &ToolContext, policy: &Policy) -> PathBuf {
    let lists = &ctx.config.wordlists;
    let by_technology = ctx.input.technologies.iter().find_map(|tech| {
        lists
            .technology
            .iter()
            .find(|(name, path)| tech.contains(name.as_str()) && path.exists())
            .map(|(_, path)| path.clone())
    });
    if let Some(path) = by_technology {
        tracing::debug!("Using technology wordlist {:?}", path);
        return path;
    }
    match policy.wordlist_tier {
        WordlistTier::Full => lists.directories.clone(),
        WordlistTier::Small => lists.directories_small.clone(),
    }
}

fn filters<'a>(ctx: &'a ToolContext, policy: &'a Policy) -> Vec<&'a ResponseFilter> {
    let Some(host) = parse_url(ctx.unit.input()).and_then(|url| url.host_str().map(str::to_string))
    else {
        return Vec::new();
    };
    policy.filters_for(&host)
}

/// Statuses worth filtering outright: only blocking responses, since a
/// wildcard 200 still leaves room for real content at other lengths.
fn blocked_statuses(ctx: &ToolContext, filters: &[&ResponseFilter]) -> Vec<String> {
    let mut statuses: Vec<u16> = filters
        .iter()
        .map(|filter| filter.status)
        .filter(|status| ctx.config.adaptive.block_statuses.contains(status))
        .collect();
    statuses.sort_unstable();
    statuses.dedup();
    statuses.iter().map(u16::to_string).collect()
}

fn join_url(base: &str, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn is_ignored(url: &str, ctx: &ToolContext) -> bool {
    let Some(parsed) = parse_url(url) else {
        return false;
    };
    let path = parsed.path().to_ascii_lowercase();
    let Some((_, ext)) = path.rsplit_once('.') else {
        return false;
    };
    ctx.config
        .scan
        .ignored_extensions
        .iter()
        .any(|ignored| ignored.eq_ignore_ascii_case(ext))
}

/// One discovered path with the values the tool reported.
fn path_finding(
    ctx: &ToolContext,
    url: &str,
    status: Option<u16>,
    length: Option<u64>,
    redirect: Option<&str>,
    source: &str,
) -> Vec<Finding> {
    if is_ignored(url, ctx) {
        return Vec::new();
    }
    let Some(mut finding) = Finding::path(url, source) else {
        return Vec::new();
    };
    if let Finding::Path(path) = &mut finding {
        path.status_code = status.map(|s| Sourced::new(s, source, Evidence::Reported));
        path.content_length = length.map(|l| Sourced::new(l, source, Evidence::Reported));
        path.redirect = redirect
            .filter(|r| !r.is_empty())
            .map(|r| Sourced::new(r.to_string(), source, Evidence::Reported));
    }
    vec![finding]
}

fn accepts_base_url(input: &str) -> bool {
    parse_url(input).is_some()
}

pub struct Ffuf;

impl ToolAdapter for Ffuf {
    fn name(&self) -> &'static str {
        "ffuf"
    }

    fn binary(&self) -> &'static str {
        "ffuf"
    }

    fn phase(&self) -> Phase {
        Phase::Directories
    }

    fn cost_hint(&self) -> u32 {
        30
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_base_url(input)
    }

    fn output_sink(&self) -> Option<&'static str> {
        Some("json")
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let base = ctx.unit.input().trim_end_matches('/');
        let mut spec = ctx
            .command(policy)
            .opt("-u", format!("{base}/FUZZ"))
            .opt("-w", wordlist(ctx, policy).display().to_string())
            .opt("-o", ctx.output_file()?)
            .args(["-of", "json", "-s"])
            .opt("-t", policy.tool_threads.max(1).to_string());
        let depth = ctx.config.scan.recursion_depth;
        if depth > 0 {
            spec = spec
                .arg("-recursion")
                .opt("-recursion-depth", depth.to_string());
        }
        if !policy.delay_range_ms.is_zero() {
            spec = spec.opt("-p", policy.delay_range_ms.as_seconds_span());
        }
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-x", proxy.clone());
        }
        let filters = filters(ctx, policy);
        if !filters.is_empty() {
            let sizes: Vec<String> = filters
                .iter()
                .map(|f| format!("{}-{}", f.length_min, f.length_max))
                .collect();
            spec = spec.opt("-fs", sizes.join(","));
            let statuses = blocked_statuses(ctx, &filters);
            if !statuses.is_empty() {
                spec = spec.opt("-fc", statuses.join(","));
            }
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let Some(sink) = raw.sink.as_deref().filter(|s| !s.trim().is_empty()) else {
            // -s prints bare words on stdout; without the sink there is nothing to key on
            return ParseOutcome::new(Vec::new(), 0, usize::from(!raw.stdout.trim().is_empty()));
        };
        let Ok(document) = serde_json::from_str::<Value>(sink) else {
            return ParseOutcome::new(Vec::new(), 0, 1);
        };
        let Some(results) = document.get("results").and_then(Value::as_array) else {
            return ParseOutcome::new(Vec::new(), 0, 1);
        };
        let mut findings = Vec::new();
        let mut skipped = 0;
        for entry in results {
            let Some(url) = entry.get("url").and_then(Value::as_str) else {
                skipped += 1;
                continue;
            };
            let status = entry
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok());
            let length = entry.get("length").and_then(Value::as_u64);
            let redirect = entry.get("redirectlocation").and_then(Value::as_str);
            findings.extend(path_finding(ctx, url, status, length, redirect, self.name()));
        }
        // an empty results array is a clean run with nothing found
        ParseOutcome::new(findings, results.len() - skipped + usize::from(results.is_empty()), skipped)
    }
}

pub struct Feroxbuster;

impl Feroxbuster {
    /// `200      GET       12l       40w     1423c http://host/admin [=> http://host/admin/]`
    fn parse_line(line: &str) -> Option<(u16, u64, &str, Option<&str>)> {
        let mut tokens = line.split_whitespace();
        let status: u16 = tokens.next()?.parse().ok()?;
        let mut length = None;
        let mut url = None;
        let mut redirect = None;
        while let Some(token) = tokens.next() {
            if let Some(chars) = token.strip_suffix('c') {
                if let Ok(n) = chars.parse::<u64>() {
                    length = Some(n);
                    continue;
                }
            }
            if token == "=>" {
                redirect = tokens.next();
            } else if token.starts_with("http://") || token.starts_with("https://") {
                url = Some(token);
            }
        }
        Some((status, length?, url?, redirect))
    }

    fn rate_limit(policy: &Policy) -> Option<u64> {
        let delay = policy.delay_range_ms;
        if delay.is_zero() {
            return None;
        }
        let mean_ms = (delay.min_ms + delay.max_ms) / 2;
        Some((1000 / mean_ms.max(1)).max(1))
    }
}

impl ToolAdapter for Feroxbuster {
    fn name(&self) -> &'static str {
        "feroxbuster"
    }

    fn binary(&self) -> &'static str {
        "feroxbuster"
    }

    fn phase(&self) -> Phase {
        Phase::Directories
    }

    fn cost_hint(&self) -> u32 {
        35
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_base_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .opt("-u", ctx.unit.input())
            .opt("-w", wordlist(ctx, policy).display().to_string())
            .opt("-t", policy.tool_threads.max(1).to_string())
            .opt("-d", ctx.config.scan.recursion_depth.to_string())
            .args(["--quiet", "--no-state", "--insecure"]);
        if let Some(rate) = Self::rate_limit(policy) {
            spec = spec.opt("--rate-limit", rate.to_string());
        }
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-p", proxy.clone());
        }
        let filters = filters(ctx, policy);
        for filter in &filters {
            // -S takes exact sizes only
            for size in filter.length_min..=filter.length_max {
                spec = spec.opt("-S", size.to_string());
            }
        }
        for status in blocked_statuses(ctx, &filters) {
            spec = spec.opt("-C", status);
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| {
            let (status, length, url, redirect) = Self::parse_line(line)?;
            Some(path_finding(ctx, url, Some(status), Some(length), redirect, self.name()))
        })
    }
}

pub struct Dirsearch;

impl Dirsearch {
    fn size_in_bytes(number: &str, unit: &str) -> Option<u64> {
        let value: f64 = number.parse().ok()?;
        let multiplier = match unit {
            "B" => 1.0,
            "KB" => 1024.0,
            "MB" => 1024.0 * 1024.0,
            "GB" => 1024.0 * 1024.0 * 1024.0,
            _ => return None,
        };
        Some((value * multiplier).round() as u64)
    }
}

impl ToolAdapter for Dirsearch {
    fn name(&self) -> &'static str {
        "dirsearch"
    }

    fn binary(&self) -> &'static str {
        "dirsearch"
    }

    fn phase(&self) -> Phase {
        Phase::Directories
    }

    fn cost_hint(&self) -> u32 {
        45
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_base_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .opt("-u", ctx.unit.input())
            .opt("-w", wordlist(ctx, policy).display().to_string())
            .opt("-t", policy.tool_threads.max(1).to_string())
            .args(["-q", "--no-color"]);
        if ctx.config.scan.recursion_depth > 0 {
            spec = spec
                .arg("-r")
                .opt("--max-recursion-depth", ctx.config.scan.recursion_depth.to_string());
        }
        let delay = policy.delay_range_ms;
        if !delay.is_zero() {
            spec = spec.opt("--delay", format!("{}", delay.max_ms as f64 / 1000.0));
        }
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("--proxy", proxy.clone());
        }
        let filters = filters(ctx, policy);
        if !filters.is_empty() {
            let sizes: Vec<String> = filters
                .iter()
                .flat_map(|f| f.length_min..=f.length_max)
                .map(|size| format!("{size}B"))
                .collect();
            spec = spec.opt("--exclude-sizes", sizes.join(","));
            let statuses = blocked_statuses(ctx, &filters);
            if !statuses.is_empty() {
                spec = spec.opt("--exclude-status", statuses.join(","));
            }
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let base = ctx.unit.input();
        parse_lines(&raw.stdout, |line| {
            let caps = DIRSEARCH_RE.captures(line)?;
            let status: u16 = caps[1].parse().ok()?;
            let length = Self::size_in_bytes(&caps[2], &caps[3]);
            let url = join_url(base, &caps[4]);
            let redirect = caps.get(5).map(|m| m.as_str());
            Some(path_finding(ctx, &url, Some(status), length, redirect, self.name()))
        })
    }
}

pub struct Gobuster;

impl ToolAdapter for Gobuster {
    fn name(&self) -> &'static str {
        "gobuster"
    }

    fn binary(&self) -> &'static str {
        "gobuster"
    }

    fn phase(&self) -> Phase {
        Phase::Directories
    }

    fn cost_hint(&self) -> u32 {
        25
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_base_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .arg("dir")
            .opt("-u", ctx.unit.input())
            .opt("-w", wordlist(ctx, policy).display().to_string())
            .opt("-t", policy.tool_threads.max(1).to_string())
            .args(["-q", "-z", "-k", "--no-error"]);
        let delay = policy.delay_range_ms;
        if !delay.is_zero() {
            spec = spec.opt("--delay", format!("{}ms", delay.max_ms));
        }
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("--proxy", proxy.clone());
        }
        let filters = filters(ctx, policy);
        if !filters.is_empty() {
            let lengths: Vec<String> = filters
                .iter()
                .flat_map(|f| f.length_min..=f.length_max)
                .map(|length| length.to_string())
                .collect();
            spec = spec.opt("--exclude-length", lengths.join(","));
            let mut statuses = blocked_statuses(ctx, &filters);
            if !statuses.is_empty() {
                // -b replaces the default blacklist, so keep 404 in it
                statuses.insert(0, "404".to_string());
                spec = spec.opt("-b", statuses.join(","));
            }
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let base = ctx.unit.input();
        parse_lines(&raw.stdout, |line| {
            let caps = GOBUSTER_RE.captures(line)?;
            let status: u16 = caps[2].parse().ok()?;
            let length = caps.get(3).and_then(|m| m.as_str().parse().ok());
            let url = join_url(base, &caps[1]);
            let redirect = caps.get(4).map(|m| m.as_str());
            Some(path_finding(ctx, &url, Some(status), length, redirect, self.name()))
        })
    }
}
