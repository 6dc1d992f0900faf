//! Target validation and host exclusion, applied before any phase runs.

use super::errors::EngineError;
use super::models::{Target, TargetKind};
use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::time::Duration;
use url::{Host, Url};

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,62}$")
        .expect("domain regex")
});

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Classify and canonicalise a user-supplied target. Accepts bare hosts,
/// `host:port`, and URLs; anything else is `ConfigInvalid`.
pub fn parse_target(raw: &str) -> Result<Target, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::ConfigInvalid("empty target".to_string()));
    }

    let url = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{trimmed}"))
    }
    .map_err(|e| EngineError::ConfigInvalid(format!("malformed target '{trimmed}': {e}")))?;

    let explicit_port = url.port();
    let (host, kind) = match url.host() {
        Some(Host::Ipv4(ip)) => (ip.to_string(), TargetKind::Ip),
        Some(Host::Ipv6(ip)) => (ip.to_string(), TargetKind::Ip),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if !DOMAIN_RE.is_match(&domain) {
                return Err(EngineError::ConfigInvalid(format!(
                    "'{trimmed}' is neither a domain nor an IP address"
                )));
            }
            (domain, TargetKind::Domain)
        }
        None => {
            return Err(EngineError::ConfigInvalid(format!(
                "target '{trimmed}' has no host"
            )));
        }
    };

    let domain = match kind {
        TargetKind::Domain => host.strip_prefix("www.").unwrap_or(&host).to_string(),
        TargetKind::Ip => host.clone(),
    };

    Ok(Target {
        raw: trimmed.to_string(),
        host,
        domain,
        kind,
        port: explicit_port,
        resolved: Vec::new(),
    })
}

/// Resolve a domain target's addresses. Lookup failure is not fatal: tools
/// resolve on their own and the report simply carries an empty address set.
pub async fn resolve_target(target: Target, timeout: Duration) -> Target {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return target.with_resolved(vec![ip]);
    }
    let addrs = lookup(&target.host, timeout).await;
    if addrs.is_empty() {
        tracing::warn!("Could not resolve {}", target.host);
    }
    target.with_resolved(addrs)
}

pub async fn lookup(host: &str, timeout: Duration) -> Vec<IpAddr> {
    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => {
            let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
            ips.sort();
            ips.dedup();
            ips
        }
        Ok(Err(e)) => {
            tracing::debug!("lookup {} failed: {}", host, e);
            Vec::new()
        }
        Err(_) => {
            tracing::debug!("lookup {} timed out", host);
            Vec::new()
        }
    }
}

/// Host part of a bare host, `host:port`, or URL, lowercased.
pub fn host_of(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let url = if value.contains("://") {
        Url::parse(value).ok()?
    } else {
        Url::parse(&format!("http://{value}")).ok()?
    };
    let host = match url.host()? {
        Host::Domain(domain) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    };
    Some(host)
}

/// `true` if `host` is `domain` itself or one of its subdomains.
pub fn in_domain(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Glob-style host exclusions (`*.dev.example.com`, `old.example.com`).
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    patterns: Vec<Pattern>,
}

impl ExclusionSet {
    pub fn new(patterns: &[String]) -> Result<Self, EngineError> {
        let patterns = patterns
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                Pattern::new(&raw.to_ascii_lowercase()).map_err(|e| {
                    EngineError::ConfigInvalid(format!("invalid exclusion pattern '{raw}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Accepts hosts and URLs; the host part is what gets matched.
    pub fn is_excluded(&self, value: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let Some(host) = host_of(value) else {
            return false;
        };
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(&host, MATCH_OPTIONS))
    }

    pub fn retain_allowed(&self, values: Vec<String>) -> (Vec<String>, Vec<String>) {
        values.into_iter().partition(|value| !self.is_excluded(value))
    }
}
