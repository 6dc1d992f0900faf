//! Report artifacts: `results.json` (the full [`RunReport`]) and a
//! human-oriented `summary.md` rendered from an embedded template.

use crate::core::findings::{CrawlCategory, Finding};
use crate::core::models::RunDirs;
use crate::core::normalizer::WildcardSignature;
use crate::core::state::RunReport;
use crate::utils::fs::atomic_write;
use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md.j2");

pub const RESULTS_FILE: &str = "results.json";
pub const SUMMARY_FILE: &str = "summary.md";

/// Write both artifacts; returns their paths.
pub fn write_all(report: &RunReport, dirs: &RunDirs) -> Result<Vec<PathBuf>> {
    let results = write_json(report, dirs)?;
    let summary = write_markdown(report, dirs)?;
    Ok(vec![results, summary])
}

fn write_json(report: &RunReport, dirs: &RunDirs) -> Result<PathBuf> {
    let path = dirs.report.join(RESULTS_FILE);
    let json = serde_json::to_string_pretty(report).context("Failed to serialise run report")?;
    atomic_write(&path, json.as_bytes())?;
    Ok(path)
}

fn write_markdown(report: &RunReport, dirs: &RunDirs) -> Result<PathBuf> {
    let rendered = render_summary(report)?;
    let path = dirs.report.join(SUMMARY_FILE);
    atomic_write(&path, rendered.as_bytes())?;
    Ok(path)
}

#[derive(Serialize)]
struct PhaseRow {
    name: String,
    status: String,
    visible: usize,
    hidden: usize,
    tools_run: Vec<String>,
    tools_failed: Vec<String>,
    tools_skipped: Vec<String>,
    incomplete_tools: Vec<String>,
    duration_ms: u128,
}

#[derive(Serialize)]
struct TechRow {
    host: String,
    name: String,
    version: Option<String>,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct SubdomainRow {
    host: String,
    status: Option<u16>,
    address: Option<String>,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct PortRow {
    host: String,
    port: u16,
    protocol: String,
    service: Option<String>,
    version: Option<String>,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct PathRow {
    url: String,
    status: Option<u16>,
    length: Option<u64>,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct CrawlGroup {
    category: String,
    urls: Vec<String>,
}

#[derive(Serialize)]
struct PolicyRow {
    revision: u32,
    phase: Option<String>,
    reason: String,
    safe_mode: bool,
    concurrency: usize,
}

#[derive(Serialize)]
struct IssueRow {
    kind: String,
    phase: Option<String>,
    tool: Option<String>,
    message: String,
}

/// snake_case name a value serialises to.
fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn render_summary(report: &RunReport) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("summary.md", SUMMARY_TEMPLATE)
        .context("Invalid summary template")?;
    let template = env.get_template("summary.md")?;

    let phases: Vec<PhaseRow> = report
        .phases
        .iter()
        .map(|result| {
            let visible = result.visible_findings().count();
            PhaseRow {
                name: result.phase.to_string(),
                status: label(&result.status),
                visible,
                hidden: result.len() - visible,
                tools_run: result.tools_run.iter().cloned().collect(),
                tools_failed: result.tools_failed.iter().cloned().collect(),
                tools_skipped: result.tools_skipped.iter().cloned().collect(),
                incomplete_tools: result.incomplete_tools.iter().cloned().collect(),
                duration_ms: result.duration_ms,
            }
        })
        .collect();

    let mut technologies = Vec::new();
    let mut subdomains = Vec::new();
    let mut ports = Vec::new();
    let mut paths = Vec::new();
    let mut crawl: BTreeMap<CrawlCategory, Vec<String>> = BTreeMap::new();
    let mut wildcards: Vec<&WildcardSignature> = Vec::new();

    for result in &report.phases {
        wildcards.extend(&result.wildcard_signatures);
        for finding in result.visible_findings() {
            let sources = finding.sources().iter().cloned().collect();
            match finding {
                Finding::Technology(t) => technologies.push(TechRow {
                    host: t.host.clone(),
                    name: t.name.clone(),
                    version: t.version.as_ref().map(|v| v.value.clone()),
                    sources,
                }),
                Finding::Subdomain(s) => subdomains.push(SubdomainRow {
                    host: s.host.clone(),
                    status: s.http_status.as_ref().map(|v| v.value),
                    address: s.resolved_ip.as_ref().map(|v| v.value.to_string()),
                    sources,
                }),
                Finding::Port(p) => ports.push(PortRow {
                    host: p.host.clone(),
                    port: p.port,
                    protocol: p.protocol.to_string(),
                    service: p.service.as_ref().map(|v| v.value.clone()),
                    version: p.version.as_ref().map(|v| v.value.clone()),
                    sources,
                }),
                Finding::Path(p) => paths.push(PathRow {
                    url: p.url.clone(),
                    status: p.status_code.as_ref().map(|v| v.value),
                    length: p.content_length.as_ref().map(|v| v.value),
                    sources,
                }),
                Finding::Crawl(c) => crawl.entry(c.category).or_default().push(c.url.clone()),
            }
        }
    }
    let crawl: Vec<CrawlGroup> = crawl
        .into_iter()
        .map(|(category, urls)| CrawlGroup {
            category: label(&category),
            urls,
        })
        .collect();

    let policy_history: Vec<PolicyRow> = report
        .policy_history
        .iter()
        .map(|change| PolicyRow {
            revision: change.revision,
            phase: change.phase.map(|p| p.to_string()),
            reason: change.reason.clone(),
            safe_mode: change.policy.safe_mode,
            concurrency: change.policy.concurrency_limit,
        })
        .collect();
    let issues: Vec<IssueRow> = report
        .issues
        .iter()
        .map(|issue| IssueRow {
            kind: label(&issue.kind),
            phase: issue.phase.map(|p| p.to_string()),
            tool: issue.tool.clone(),
            message: issue.message.clone(),
        })
        .collect();

    let waf = match (report.waf.probed, report.waf.detected, &report.waf.vendor) {
        (false, _, _) => "not probed".to_string(),
        (true, true, Some(vendor)) => format!("detected ({vendor})"),
        (true, true, None) => "detected".to_string(),
        (true, false, _) => "none detected".to_string(),
    };
    let finished = report.finished_at.unwrap_or(report.started_at);
    let duration_seconds = (finished - report.started_at).num_seconds().max(0);

    let rendered = template.render(context! {
        target => &report.target,
        run_id => &report.run_id,
        status => label(&report.status),
        started_at => report.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        finished_at => report
            .finished_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string()),
        duration_seconds => duration_seconds,
        waf => waf,
        version => env!("CARGO_PKG_VERSION"),
        phases => phases,
        technologies => technologies,
        subdomains => subdomains,
        ports => ports,
        paths => paths,
        wildcards => wildcards,
        crawl => crawl,
        policy_history => policy_history,
        missing_tools => &report.missing_tools,
        issues => issues,
    })?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{Issue, IssueKind};
    use crate::core::models::Phase;
    use crate::core::policy::WafVerdict;
    use crate::core::state::RunStatus;
    use crate::core::store::PhaseResult;
    use chrono::Utc;

    fn report() -> RunReport {
        let mut subdomains = PhaseResult::new(Phase::Subdomains);
        for host in ["api.example.com", "www.example.com"] {
            let finding = Finding::subdomain(host, "subfinder").unwrap();
            subdomains.findings.insert(finding.identity_key(), finding);
        }
        subdomains.tools_run.insert("subfinder".into());
        RunReport {
            run_id: "run_example.com_20240501_130405".into(),
            target: "example.com".into(),
            status: RunStatus::Partial,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            waf: WafVerdict {
                detected: true,
                vendor: Some("Cloudflare".into()),
                probed: true,
            },
            policy_history: Vec::new(),
            phases: vec![subdomains, PhaseResult::new(Phase::Ports)],
            issues: vec![
                Issue::new(IssueKind::ToolMissing, "tool missing: naabu is not on PATH")
                    .in_phase(Phase::Ports)
                    .for_tool("naabu"),
            ],
            missing_tools: vec!["naabu".into()],
        }
    }

    #[test]
    fn summary_mentions_findings_and_annotations() {
        let text = render_summary(&report()).unwrap();
        assert!(text.contains("# shadowmap report: example.com"));
        assert!(text.contains("**partial**"));
        assert!(text.contains("detected (Cloudflare)"));
        assert!(text.contains("| api.example.com |"));
        assert!(text.contains("tool_missing"));
        assert!(text.contains("- naabu"));
    }

    #[test]
    fn artifacts_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = RunDirs {
            root: dir.path().to_path_buf(),
            raw: dir.path().join("raw"),
            tmp: dir.path().join("tmp"),
            report: dir.path().to_path_buf(),
        };
        let written = write_all(&report(), &dirs).unwrap();
        assert_eq!(written.len(), 2);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(RESULTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["phases"][0]["findings"].as_array().unwrap().len(), 2);
        assert_eq!(json["waf"]["vendor"], "Cloudflare");
    }
}
