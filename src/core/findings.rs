//! Unified finding model and the field-level merge used for deduplication.
//!
//! Every mergeable field is a [`Sourced`] value: the value, the tool that
//! produced it and how strongly it is backed ([`Evidence`]). Merging picks,
//! per field, the value with the highest evidence, then the lexically smaller
//! source, then the smaller value. That order is total, so merging is
//! commutative and associative and repeated runs on identical input always
//! pick the same value regardless of completion order.

use super::models::Phase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use url::Url;

/// How strongly a field value is backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// Guessed from indirect data (port number to service name, ...).
    Inferred,
    /// Reported by a discovery tool.
    Reported,
    /// Observed by an active verification step (HTTP probe, nmap -sV).
    Verified,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: String,
    pub evidence: Evidence,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: impl Into<String>, evidence: Evidence) -> Self {
        Self {
            value,
            source: source.into(),
            evidence,
        }
    }
}

impl<T: Ord> Sourced<T> {
    fn outranks(&self, other: &Self) -> bool {
        self.evidence
            .cmp(&other.evidence)
            .then_with(|| other.source.cmp(&self.source))
            .then_with(|| other.value.cmp(&self.value))
            .is_gt()
    }
}

/// Keep the more authoritative of two optional field values.
pub fn merge_field<T: Ord>(current: &mut Option<Sourced<T>>, incoming: Option<Sourced<T>>) {
    let Some(incoming) = incoming else {
        return;
    };
    match current {
        Some(existing) if !incoming.outranks(existing) => {}
        _ => *current = Some(incoming),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Category of a crawled URL, highest precedence first: js, parameter, api, generic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlCategory {
    Generic,
    Api,
    Parameter,
    Js,
}

const API_KEYWORDS: &[&str] = &["api", "rest", "graphql", "rpc", "json", "xml"];

impl CrawlCategory {
    /// Classifies on path and query only; a host named `api.` does not make
    /// every URL on it an API endpoint.
    pub fn classify(url: &Url) -> CrawlCategory {
        let path = url.path().to_ascii_lowercase();
        let query = url.query().unwrap_or_default();
        if path.ends_with(".js") {
            CrawlCategory::Js
        } else if query.contains('=') {
            CrawlCategory::Parameter
        } else if API_KEYWORDS
            .iter()
            .any(|kw| path.contains(kw) || query.to_ascii_lowercase().contains(kw))
        {
            CrawlCategory::Api
        } else {
            CrawlCategory::Generic
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TechnologyFinding {
    pub host: String,
    pub name: String,
    pub version: Option<Sourced<String>>,
    pub sources: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubdomainFinding {
    pub host: String,
    pub resolved_ip: Option<Sourced<IpAddr>>,
    pub http_status: Option<Sourced<u16>>,
    pub url: Option<Sourced<String>>,
    pub sources: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortFinding {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub service: Option<Sourced<String>>,
    pub version: Option<Sourced<String>>,
    pub sources: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathFinding {
    pub url: String,
    pub host: String,
    pub status_code: Option<Sourced<u16>>,
    pub content_length: Option<Sourced<u64>>,
    pub redirect: Option<Sourced<String>>,
    pub sources: BTreeSet<String>,
    /// Set by wildcard suppression; hidden from the default view but kept.
    pub likely_wildcard: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrawlFinding {
    pub url: String,
    pub category: CrawlCategory,
    pub sources: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    Technology(TechnologyFinding),
    Subdomain(SubdomainFinding),
    Port(PortFinding),
    Path(PathFinding),
    Crawl(CrawlFinding),
}

/// Deduplication key: phase plus primary locator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub phase: Phase,
    pub locator: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phase.index(), self.locator)
    }
}

impl Finding {
    pub fn subdomain(host: &str, source: &str) -> Option<Finding> {
        Some(Finding::Subdomain(SubdomainFinding {
            host: normalize_host(host)?,
            resolved_ip: None,
            http_status: None,
            url: None,
            sources: BTreeSet::from([source.to_string()]),
        }))
    }

    pub fn port(host: &str, port: u16, protocol: Protocol, source: &str) -> Option<Finding> {
        if port == 0 {
            return None;
        }
        Some(Finding::Port(PortFinding {
            host: normalize_host(host)?,
            port,
            protocol,
            service: None,
            version: None,
            sources: BTreeSet::from([source.to_string()]),
        }))
    }

    pub fn path(url: &str, source: &str) -> Option<Finding> {
        let parsed = parse_url(url)?;
        Some(Finding::Path(PathFinding {
            host: parsed.host_str()?.to_string(),
            url: parsed.to_string(),
            status_code: None,
            content_length: None,
            redirect: None,
            sources: BTreeSet::from([source.to_string()]),
            likely_wildcard: false,
        }))
    }

    pub fn crawl(url: &str, source: &str) -> Option<Finding> {
        let parsed = parse_url(url)?;
        Some(Finding::Crawl(CrawlFinding {
            category: CrawlCategory::classify(&parsed),
            url: parsed.to_string(),
            sources: BTreeSet::from([source.to_string()]),
        }))
    }

    pub fn technology(host: &str, name: &str, source: &str) -> Option<Finding> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Finding::Technology(TechnologyFinding {
            host: normalize_host(host)?,
            name: name.to_string(),
            version: None,
            sources: BTreeSet::from([source.to_string()]),
        }))
    }

    pub fn phase(&self) -> Phase {
        match self {
            Finding::Technology(_) => Phase::Osint,
            Finding::Subdomain(_) => Phase::Subdomains,
            Finding::Port(_) => Phase::Ports,
            Finding::Path(_) => Phase::Directories,
            Finding::Crawl(_) => Phase::Crawling,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        let locator = match self {
            Finding::Technology(t) => format!("{}|{}", t.host, t.name.to_ascii_lowercase()),
            Finding::Subdomain(s) => s.host.clone(),
            Finding::Port(p) => format!("{}:{}/{}", p.host, p.port, p.protocol),
            Finding::Path(p) => p.url.clone(),
            Finding::Crawl(c) => c.url.clone(),
        };
        IdentityKey {
            phase: self.phase(),
            locator,
        }
    }

    pub fn sources(&self) -> &BTreeSet<String> {
        match self {
            Finding::Technology(t) => &t.sources,
            Finding::Subdomain(s) => &s.sources,
            Finding::Port(p) => &p.sources,
            Finding::Path(p) => &p.sources,
            Finding::Crawl(c) => &c.sources,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Finding::Technology(t) => Some(&t.host),
            Finding::Subdomain(s) => Some(&s.host),
            Finding::Port(p) => Some(&p.host),
            Finding::Path(p) => Some(&p.host),
            Finding::Crawl(_) => None,
        }
    }

    pub fn is_likely_wildcard(&self) -> bool {
        matches!(self, Finding::Path(p) if p.likely_wildcard)
    }

    /// Fold `other` into `self`. Both must share an identity key; a mismatch
    /// is refused and `other` is returned untouched.
    pub fn absorb(&mut self, other: Finding) -> Result<(), Finding> {
        if self.identity_key() != other.identity_key() {
            return Err(other);
        }
        match (self, other) {
            (Finding::Technology(a), Finding::Technology(b)) => {
                merge_field(&mut a.version, b.version);
                a.sources.extend(b.sources);
            }
            (Finding::Subdomain(a), Finding::Subdomain(b)) => {
                merge_field(&mut a.resolved_ip, b.resolved_ip);
                merge_field(&mut a.http_status, b.http_status);
                merge_field(&mut a.url, b.url);
                a.sources.extend(b.sources);
            }
            (Finding::Port(a), Finding::Port(b)) => {
                merge_field(&mut a.service, b.service);
                merge_field(&mut a.version, b.version);
                a.sources.extend(b.sources);
            }
            (Finding::Path(a), Finding::Path(b)) => {
                merge_field(&mut a.status_code, b.status_code);
                merge_field(&mut a.content_length, b.content_length);
                merge_field(&mut a.redirect, b.redirect);
                a.sources.extend(b.sources);
                a.likely_wildcard |= b.likely_wildcard;
            }
            (Finding::Crawl(a), Finding::Crawl(b)) => {
                a.category = a.category.max(b.category);
                a.sources.extend(b.sources);
            }
            // identity keys embed the phase, so variants always line up here
            (_, other) => return Err(other),
        }
        Ok(())
    }
}

/// Lowercase host without scheme, port, trailing dot or leading `*.`.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim().trim_start_matches("*.");
    let host = crate::core::scope::host_of(raw)?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Parse and canonicalise an http(s) URL: no fragment, no trailing slash on
/// non-root paths.
pub fn parse_url(raw: &str) -> Option<Url> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url)
}

pub fn normalize_url(raw: &str) -> Option<String> {
    parse_url(raw).map(|url| url.to_string())
}
