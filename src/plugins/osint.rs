//! Phase 0: technology fingerprinting.

use super::types::{CommandSpec, ParseOutcome, RawOutput, ToolAdapter, ToolContext, parse_lines};
use crate::core::errors::EngineError;
use crate::core::findings::{Evidence, Finding, Sourced};
use crate::core::models::Phase;
use crate::core::policy::Policy;
use serde_json::Value;

/// whatweb plugins that describe the response rather than a technology.
const WHATWEB_NOISE: &[&str] = &[
    "ip",
    "script",
    "title",
    "country",
    "email",
    "httpserver",
    "uncommonheaders",
    "redirectlocation",
    "metagenerator",
    "html5",
];

pub struct WhatWeb;

impl WhatWeb {
    fn findings_from(entry: &Value, fallback_host: &str, source: &str) -> Vec<Finding> {
        let host = entry
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or(fallback_host);
        let Some(plugins) = entry.get("plugins").and_then(Value::as_object) else {
            return Vec::new();
        };
        plugins
            .iter()
            .filter(|(name, _)| !WHATWEB_NOISE.contains(&name.to_ascii_lowercase().as_str()))
            .filter_map(|(name, details)| {
                let mut finding = Finding::technology(host, &name.replace('-', " "), source)?;
                let version = details
                    .get("version")
                    .and_then(Value::as_array)
                    .map(|versions| {
                        versions
                            .iter()
                            .filter_map(|v| match v {
                                Value::String(s) => Some(s.clone()),
                                Value::Number(n) => Some(n.to_string()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .filter(|v| !v.is_empty());
                if let (Finding::Technology(tech), Some(version)) = (&mut finding, version) {
                    tech.version = Some(Sourced::new(version, source, Evidence::Reported));
                }
                Some(finding)
            })
            .collect()
    }
}

impl ToolAdapter for WhatWeb {
    fn name(&self) -> &'static str {
        "whatweb"
    }

    fn binary(&self) -> &'static str {
        "whatweb"
    }

    fn phase(&self) -> Phase {
        Phase::Osint
    }

    fn cost_hint(&self) -> u32 {
        20
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .arg("--no-error")
            .arg("--log-json=-")
            .opt("--user-agent", policy.headers.user_agent_for_invocation());
        if let Some(proxy) = ctx.config.proxy_authority() {
            spec = spec.opt("--proxy", proxy);
        }
        Ok(spec.arg(ctx.unit.input()))
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let host = ctx.unit.input();
        // --log-json writes one JSON array; older builds write one object per line
        if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(raw.stdout.trim()) {
            let findings = entries
                .iter()
                .flat_map(|entry| Self::findings_from(entry, host, self.name()))
                .collect();
            return ParseOutcome::new(findings, entries.len(), 0);
        }
        parse_lines(&raw.stdout, |line| {
            let line = line.trim_end_matches(',');
            if line == "[" || line == "]" {
                return Some(Vec::new());
            }
            let entry: Value = serde_json::from_str(line).ok()?;
            Some(Self::findings_from(&entry, host, self.name()))
        })
    }
}

/// httpx with `-tech-detect` against the target itself.
pub struct HttpxTech;

impl ToolAdapter for HttpxTech {
    fn name(&self) -> &'static str {
        "httpx-tech"
    }

    fn binary(&self) -> &'static str {
        "httpx"
    }

    fn phase(&self) -> Phase {
        Phase::Osint
    }

    fn cost_hint(&self) -> u32 {
        10
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let mut spec = ctx
            .command(policy)
            .opt("-u", ctx.unit.input())
            .args(["-silent", "-json", "-tech-detect"]);
        for header in policy.headers.for_invocation() {
            spec = spec.opt("-H", header);
        }
        if let Some(proxy) = &ctx.config.proxy {
            spec = spec.opt("-http-proxy", proxy.clone());
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| {
            let entry: Value = serde_json::from_str(line).ok()?;
            // newer httpx builds put the address in `host`; `input` is what we passed
            let host = ["input", "host"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str).filter(|h| !h.is_empty()))
                .unwrap_or(ctx.unit.input())
                .to_string();
            let techs = entry.get("tech").and_then(Value::as_array).cloned().unwrap_or_default();
            Some(
                techs
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|tech| {
                        let (name, version) = match tech.split_once(':') {
                            Some((name, version)) => (name, Some(version.trim())),
                            None => (tech, None),
                        };
                        let mut finding = Finding::technology(&host, name, self.name())?;
                        if let (Finding::Technology(t), Some(v)) = (&mut finding, version) {
                            if !v.is_empty() {
                                t.version = Some(Sourced::new(v.to_string(), self.name(), Evidence::Reported));
                            }
                        }
                        Some(finding)
                    })
                    .collect(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::testing::{context, policy};

    const WHATWEB_ARRAY: &str = r#"[
{"target":"http://example.com","http_status":200,"plugins":{"Country":{"string":["UNITED STATES"]},"HTTPServer":{"string":["nginx"]},"WordPress":{"version":["6.4.2"]},"JQuery":{},"IP":{"string":["93.184.216.34"]}}}
]"#;

    #[test]
    fn whatweb_array_output() {
        let ctx = context("example.com", &["example.com"]);
        let outcome = WhatWeb.parse(&RawOutput::from_stdout(WHATWEB_ARRAY), &ctx);
        assert!(!outcome.degraded);
        let names: Vec<(String, Option<String>)> = outcome
            .findings
            .iter()
            .map(|f| match f {
                Finding::Technology(t) => (t.name.clone(), t.version.as_ref().map(|v| v.value.clone())),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                ("JQuery".to_string(), None),
                ("WordPress".to_string(), Some("6.4.2".to_string()))
            ]
        );
    }

    #[test]
    fn whatweb_line_output_tolerates_noise() {
        let ctx = context("example.com", &["example.com"]);
        let stdout = "[\n{\"target\":\"http://example.com\",\"plugins\":{\"Apache\":{\"version\":[\"2.4.41\"]}}},\nnot json\n]";
        let outcome = WhatWeb.parse(&RawOutput::from_stdout(stdout), &ctx);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.skipped_lines, 1);
    }

    #[test]
    fn httpx_tech_splits_versions() {
        let ctx = context("example.com", &["example.com"]);
        let stdout = r#"{"host":"example.com","status_code":200,"tech":["Nginx:1.18.0","PHP","Drupal:10"]}"#;
        let outcome = HttpxTech.parse(&RawOutput::from_stdout(stdout), &ctx);
        assert_eq!(outcome.findings.len(), 3);
        let drupal = outcome
            .findings
            .iter()
            .find_map(|f| match f {
                Finding::Technology(t) if t.name == "Drupal" => Some(t),
                _ => None,
            })
            .unwrap();
        assert_eq!(drupal.version.as_ref().unwrap().value, "10");
    }

    #[test]
    fn httpx_tech_invocation() {
        let ctx = context("example.com", &["example.com"]);
        let spec = HttpxTech.build_invocation(&ctx, &policy(false)).unwrap();
        assert!(spec.has_arg("-tech-detect"));
        assert!(spec.has_arg("example.com"));
    }
}
