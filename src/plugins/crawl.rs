//! Phase 4: crawlers and archive sources. Every adapter yields URLs, kept only
//! when they stay inside the target's scope.

use super::types::{
    CommandSpec, Fanout, ParseOutcome, PhaseInput, RawOutput, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Finding, parse_url};
use crate::core::models::{Phase, Target};
use crate::core::policy::Policy;
use crate::core::scope::in_domain;
use std::collections::BTreeSet;
use url::Url;

fn in_scope(url: &Url, target: &Target) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    if target.is_ip() {
        host == target.host
    } else {
        in_domain(&host, &target.domain)
    }
}

fn ignored_extension(url: &Url, ctx: &ToolContext) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.rsplit_once('.').is_some_and(|(_, ext)| {
        ctx.config
            .scan
            .ignored_extensions
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(ext))
    })
}

/// Read one URL-bearing line. `base` resolves relative endpoints.
fn crawl_line(line: &str, ctx: &ToolContext, source: &str, base: Option<&Url>) -> Option<Vec<Finding>> {
    // hakrawler -s and a few others prefix the URL with a tag
    let token = line
        .split_whitespace()
        .rev()
        .find(|token| token.contains("://") || token.starts_with('/'))
        .or_else(|| (base.is_some() && !line.contains(char::is_whitespace)).then_some(line))?;

    let url = if token.contains("://") {
        parse_url(token)?
    } else {
        parse_url(base?.join(token).ok()?.as_str())?
    };
    if !in_scope(&url, &ctx.target) || ignored_extension(&url, ctx) {
        return Some(Vec::new());
    }
    Some(Finding::crawl(url.as_str(), source).into_iter().collect())
}

fn accepts_url(input: &str) -> bool {
    parse_url(input).is_some()
}

fn seed_host(input: &str) -> Option<String> {
    parse_url(input).and_then(|url| url.host_str().map(str::to_string))
}

pub struct Katana;

impl ToolAdapter for Katana {
    fn name(&self) -> &'static str {
        "katana"
    }

    fn binary(&self) -> &'static str {
        "katana"
    }

    fn phase(&self) -> Phase {
        Phase::Crawling
    }

    fn cost_hint(&self) -> u32 {
        30
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .opt("-u", ctx.unit.input())
            .arg("-silent")
            .opt("-d", ctx.config.scan.crawl_depth.to_string())
            .arg("-jc")
            .opt("-c", policy.tool_threads.max(1).to_string());
        if !policy.delay_range_ms.is_zero() {
            let seconds = policy.delay_range_ms.max_ms.div_ceil(1000);
            spec = spec.opt("-rd", seconds.to_string());
        }
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-proxy", proxy.clone());
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| crawl_line(line, ctx, self.name(), None))
    }
}

pub struct Hakrawler;

impl ToolAdapter for Hakrawler {
    fn name(&self) -> &'static str {
        "hakrawler"
    }

    fn binary(&self) -> &'static str {
        "hakrawler"
    }

    fn phase(&self) -> Phase {
        Phase::Crawling
    }

    fn cost_hint(&self) -> u32 {
        20
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let user_agent = policy.headers.user_agent_for_invocation();
        let mut spec = ctx
            .command(policy)
            .opt("-d", ctx.config.scan.crawl_depth.to_string())
            .opt("-t", policy.tool_threads.max(1).to_string())
            .arg("-insecure")
            .opt("-h", format!("User-Agent: {user_agent}"))
            .stdin(format!("{}\n", ctx.unit.input()));
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-proxy", proxy.clone());
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| crawl_line(line, ctx, self.name(), None))
    }
}

/// paramspider works per domain, so seeds on the same host share one run.
pub struct ParamSpider;

impl ToolAdapter for ParamSpider {
    fn name(&self) -> &'static str {
        "paramspider"
    }

    fn binary(&self) -> &'static str {
        "paramspider"
    }

    fn phase(&self) -> Phase {
        Phase::Crawling
    }

    fn cost_hint(&self) -> u32 {
        25
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        seed_host(input).is_some()
    }

    fn unit_key(&self, input: &str) -> String {
        seed_host(input).unwrap_or_else(|| input.to_string())
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let host = seed_host(ctx.unit.input()).ok_or_else(|| {
            EngineError::ConfigInvalid(format!("paramspider seed has no host: {}", ctx.unit.input()))
        })?;
        let mut spec = ctx.command(policy).opt("-d", host).arg("-s");
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("--proxy", proxy.clone());
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| crawl_line(line, ctx, self.name(), None))
    }
}

/// Endpoints pulled out of a page's JavaScript; relative ones are resolved
/// against the seed.
pub struct LinkFinder;

impl ToolAdapter for LinkFinder {
    fn name(&self) -> &'static str {
        "linkfinder"
    }

    fn binary(&self) -> &'static str {
        "linkfinder"
    }

    fn phase(&self) -> Phase {
        Phase::Crawling
    }

    fn cost_hint(&self) -> u32 {
        15
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        accepts_url(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        Ok(ctx
            .command(policy)
            .arg("-d")
            .opt("-i", ctx.unit.input())
            .opt("-o", "cli"))
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let base = parse_url(ctx.unit.input());
        parse_lines(&raw.stdout, |line| {
            if line.starts_with("Running against") {
                return Some(Vec::new());
            }
            crawl_line(line, ctx, self.name(), base.as_ref())
        })
    }
}

/// Archive lookup over every seed host at once.
pub struct Gauplus;

impl ToolAdapter for Gauplus {
    fn name(&self) -> &'static str {
        "gauplus"
    }

    fn binary(&self) -> &'static str {
        "gauplus"
    }

    fn phase(&self) -> Phase {
        Phase::Crawling
    }

    fn fanout(&self) -> Fanout {
        Fanout::Batch
    }

    fn cost_hint(&self) -> u32 {
        40
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        seed_host(input).is_some()
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let hosts: BTreeSet<String> = ctx.unit.inputs.iter().filter_map(|i| seed_host(i)).collect();
        let threads = if policy.safe_mode { 5 } else { 50 };
        let mut spec = ctx
            .command(policy)
            .opt("-t", threads.to_string())
            .arg("-random-agent")
            .stdin(hosts.into_iter().map(|h| h + "\n").collect::<String>());
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-p", proxy.clone());
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| crawl_line(line, ctx, self.name(), None))
    }
}
