use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use shadowmap::config::{DelayRange, EngineConfig, GlobalConfig};
use shadowmap::core::coordinator::PhaseCoordinator;
use shadowmap::core::errors::{EngineError, IssueKind};
use shadowmap::core::events::{self, Event};
use shadowmap::core::findings::{Evidence, Finding, Protocol, Sourced};
use shadowmap::core::health::{HealthProbe, ProbeResponse};
use shadowmap::core::models::{Phase, RunDirs};
use shadowmap::core::policy::Policy;
use shadowmap::core::scheduler::RunOutcome;
use shadowmap::core::scope::parse_target;
use shadowmap::core::state::{PhaseStatus, RunReport, RunStatus};
use shadowmap::executors::command::{CommandOutput, CommandRunner, CommandSpec, Termination};
use shadowmap::organizers::layout;
use shadowmap::plugins::dirbust::Feroxbuster;
use shadowmap::plugins::subdomain::{Assetfinder, Subfinder};
use shadowmap::plugins::types::{
    Fanout, ParseOutcome, RawOutput, Stage, ToolAdapter, ToolContext, parse_lines,
};
use shadowmap::plugins::PluginRegistry;
use shadowmap::reporters::{validate, writer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Replays canned stdout per program.
#[derive(Default)]
struct ScriptedRunner {
    stdout: BTreeMap<&'static str, String>,
    calls: Mutex<Vec<CommandSpec>>,
    delay: Duration,
}

impl ScriptedRunner {
    fn with(mut self, program: &'static str, stdout: impl Into<String>) -> Self {
        self.stdout.insert(program, stdout.into());
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn is_available(&self, _program: &str) -> bool {
        true
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        _cancel: &CancellationToken,
        _grace: Duration,
    ) -> Result<CommandOutput, EngineError> {
        self.calls.lock().push(spec.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CommandOutput {
            stdout: self.stdout.get(spec.program.as_str()).cloned().unwrap_or_default(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 1,
            termination: Termination::Exited,
        })
    }
}

/// Lets the first `complete` invocations finish, then requests an abort.
/// Later invocations hang until they see it.
struct AbortingRunner {
    complete: usize,
    started: AtomicUsize,
    abort: CancellationToken,
}

#[async_trait]
impl CommandRunner for AbortingRunner {
    fn is_available(&self, _program: &str) -> bool {
        true
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        _grace: Duration,
    ) -> Result<CommandOutput, EngineError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.complete {
            if n == self.complete {
                self.abort.cancel();
            }
            return Ok(CommandOutput {
                stdout: format!("{}.example.com", spec.program),
                stderr: String::new(),
                exit_code: Some(0),
                duration_ms: 1,
                termination: Termination::Exited,
            });
        }
        cancel.cancelled().await;
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 1,
            termination: Termination::Cancelled,
        })
    }
}

/// Echoes its stdout as subdomains and remembers the policy it was built with.
struct Probe {
    name: &'static str,
    phase: Phase,
    seen: Arc<Mutex<Vec<(Phase, bool)>>>,
}

impl ToolAdapter for Probe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn binary(&self) -> &'static str {
        self.name
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn cost_hint(&self) -> u32 {
        10
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        self.seen.lock().push((self.phase, policy.safe_mode));
        Ok(ctx.command(policy).arg(ctx.unit.input()))
    }

    fn parse(&self, raw: &RawOutput, _ctx: &ToolContext) -> ParseOutcome {
        parse_lines(&raw.stdout, |line| {
            Some(Finding::subdomain(line, self.name).into_iter().collect())
        })
    }
}

type Emit = fn(&str) -> Vec<Finding>;

/// Records every input it is given and emits findings computed from them.
struct Stub {
    name: &'static str,
    phase: Phase,
    stage: Stage,
    fanout: Fanout,
    emit: Emit,
    inputs: Arc<Mutex<BTreeMap<&'static str, Vec<String>>>>,
}

impl ToolAdapter for Stub {
    fn name(&self) -> &'static str {
        self.name
    }

    fn binary(&self) -> &'static str {
        self.name
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn fanout(&self) -> Fanout {
        self.fanout
    }

    fn cost_hint(&self) -> u32 {
        10
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        self.inputs
            .lock()
            .entry(self.name)
            .or_default()
            .extend(ctx.unit.inputs.iter().cloned());
        Ok(ctx.command(policy).args(ctx.unit.inputs.clone()))
    }

    fn parse(&self, _raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let findings = ctx.unit.inputs.iter().flat_map(|input| (self.emit)(input)).collect();
        ParseOutcome::new(findings, ctx.unit.inputs.len(), 0)
    }
}

fn verified(host: &str, source: &str) -> Finding {
    let mut finding = Finding::subdomain(host, source).unwrap();
    if let Finding::Subdomain(sub) = &mut finding {
        sub.http_status = Some(Sourced::new(200, source, Evidence::Verified));
    }
    finding
}

fn path(url: &str, status: u16, length: u64) -> Finding {
    let mut finding = Finding::path(url, "bust").unwrap();
    if let Finding::Path(p) = &mut finding {
        p.status_code = Some(Sourced::new(status, "bust", Evidence::Reported));
        p.content_length = Some(Sourced::new(length, "bust", Evidence::Reported));
    }
    finding
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

fn config(dir: &TempDir, phases: &[Phase]) -> EngineConfig {
    let mut config = EngineConfig::new(GlobalConfig::default(), dir.path());
    config.targets = vec!["example.com".to_string()];
    config.phases = phases.to_vec();
    config.waf_probe = false;
    config.scan.resolve_hosts = false;
    config.adaptive.safe_delay_ms = DelayRange::ZERO;
    config
}

fn dirs(dir: &TempDir, target: &str) -> RunDirs {
    layout::prepare_run_dirs(dir.path(), target, Utc::now()).unwrap()
}

async fn run(
    config: EngineConfig,
    target: &str,
    registry: PluginRegistry,
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
    dirs: RunDirs,
) -> (RunReport, Vec<Event>) {
    let config = Arc::new(config);
    let phases = config.phases.clone();
    let (tx, mut rx) = events::channel();
    let coordinator = PhaseCoordinator::new(
        config,
        parse_target(target).unwrap(),
        dirs,
        registry,
        runner,
    )
    .unwrap()
    .with_cancel(cancel)
    .with_events(tx);

    let report = coordinator.run(&phases).await;
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    (report, seen)
}

fn phase(report: &RunReport, phase: Phase) -> &shadowmap::core::store::PhaseResult {
    report.phases.iter().find(|r| r.phase == phase).unwrap()
}

#[tokio::test]
async fn subdomains_merge_sources_across_tools() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(Subfinder));
    registry.register(Arc::new(Assetfinder));
    let runner = ScriptedRunner::default()
        .with("subfinder", "www.example.com\napi.example.com\n")
        .with("assetfinder", "WWW.example.com\nmail.example.com\nunrelated.org\n");

    let run_dirs = dirs(&dir, "example.com");
    let (report, events) = run(
        config(&dir, &[Phase::Subdomains]),
        "example.com",
        registry,
        Arc::new(runner),
        CancellationToken::new(),
        run_dirs.clone(),
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    let result = phase(&report, Phase::Subdomains);
    assert_eq!(result.status, PhaseStatus::Completed);

    let hosts: BTreeMap<String, Vec<String>> = result
        .visible_findings()
        .filter_map(|f| match f {
            Finding::Subdomain(s) => Some((s.host.clone(), s.sources.iter().cloned().collect())),
            _ => None,
        })
        .collect();
    assert_eq!(hosts.len(), 3);
    assert_eq!(hosts["www.example.com"], vec!["assetfinder", "subfinder"]);
    assert_eq!(hosts["mail.example.com"], vec!["assetfinder"]);

    let started = events
        .iter()
        .filter(|e| matches!(e, Event::ToolStarted { .. }))
        .count();
    assert_eq!(started, 2);
    assert!(matches!(events.last(), Some(Event::RunFinished { status: RunStatus::Completed })));

    writer::write_all(&report, &run_dirs).unwrap();
    validate::validate_reports(&run_dirs).unwrap();
    let summary = std::fs::read_to_string(run_dirs.report.join(writer::SUMMARY_FILE)).unwrap();
    assert!(summary.contains("www.example.com"));
}

#[tokio::test]
async fn wildcard_paths_are_hidden_but_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(Feroxbuster));

    let mut stdout = String::new();
    for i in 0..500 {
        stdout.push_str(&format!("200      GET       12l       40w     1423c https://example.com/w{i}\n"));
    }
    stdout.push_str("200      GET       80l      300w     5120c https://example.com/admin\n");
    stdout.push_str("301      GET        0l        0w        0c https://example.com/login => https://example.com/login/\n");
    let runner = ScriptedRunner::default().with("feroxbuster", stdout);

    let (report, events) = run(
        config(&dir, &[Phase::Directories]),
        "example.com",
        registry,
        Arc::new(runner),
        CancellationToken::new(),
        dirs(&dir, "example.com"),
    )
    .await;

    let result = phase(&report, Phase::Directories);
    assert_eq!(result.len(), 502);
    let mut visible: Vec<&str> = result
        .visible_findings()
        .filter_map(|f| match f {
            Finding::Path(p) => Some(p.url.as_str()),
            _ => None,
        })
        .collect();
    visible.sort();
    assert_eq!(visible, vec!["https://example.com/admin", "https://example.com/login"]);

    assert_eq!(result.wildcard_signatures.len(), 1);
    let signature = &result.wildcard_signatures[0];
    assert_eq!(signature.status, 200);
    assert_eq!(signature.matched, 500);

    // the signature becomes a response filter for later runs
    let last = report.policy_history.last().unwrap();
    assert!(last.policy.response_filters.iter().any(|f| f.host == "example.com" && f.status == 200));
    assert!(events.iter().any(|e| matches!(e, Event::PolicyChanged { .. })));
}

#[tokio::test]
async fn abort_marks_unfinished_tools_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::empty();
    for name in ["t1", "t2", "t3", "t4", "t5"] {
        registry.register(Arc::new(Probe {
            name,
            phase: Phase::Subdomains,
            seen: Arc::clone(&seen),
        }));
    }
    let cancel = CancellationToken::new();
    let runner = AbortingRunner {
        complete: 3,
        started: AtomicUsize::new(0),
        abort: cancel.clone(),
    };

    let (report, _) = run(
        config(&dir, &[Phase::Subdomains, Phase::Ports]),
        "example.com",
        registry,
        Arc::new(runner),
        cancel,
        dirs(&dir, "example.com"),
    )
    .await;

    assert_eq!(report.status, RunStatus::Aborted);
    let result = phase(&report, Phase::Subdomains);
    assert_eq!(result.status, PhaseStatus::Aborted);
    assert_eq!(result.tools_run.len(), 3);
    assert_eq!(result.incomplete_tools.len(), 2);
    assert_eq!(result.len(), 3);
    assert!(result
        .runs
        .iter()
        .filter(|r| result.incomplete_tools.contains(&r.tool))
        .all(|r| r.state == RunOutcome::Cancelled));

    // later phases never started
    assert_eq!(phase(&report, Phase::Ports).status, PhaseStatus::NotStarted);
}

#[tokio::test]
async fn ip_target_skips_subdomain_phase() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(Subfinder));
    let runner = Arc::new(ScriptedRunner::default());

    let (report, events) = run(
        config(&dir, &[Phase::Subdomains]),
        "10.0.0.1",
        registry,
        Arc::clone(&runner) as Arc<dyn CommandRunner>,
        CancellationToken::new(),
        dirs(&dir, "10.0.0.1"),
    )
    .await;

    let result = phase(&report, Phase::Subdomains);
    assert_eq!(result.status, PhaseStatus::Skipped);
    assert!(result.skipped);
    assert!(result.is_empty());
    assert!(report.issues.iter().any(|i| i.kind == IssueKind::PhaseInputEmpty));
    assert!(events.iter().any(|e| matches!(e, Event::PhaseSkipped { .. })));
    assert!(runner.calls.lock().is_empty());
}

#[tokio::test]
async fn safe_mode_applies_to_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(Probe {
        name: "osint-probe",
        phase: Phase::Osint,
        seen: Arc::clone(&seen),
    }));
    registry.register(Arc::new(Probe {
        name: "subdomain-probe",
        phase: Phase::Subdomains,
        seen: Arc::clone(&seen),
    }));
    let mut config = config(&dir, &[Phase::Osint, Phase::Subdomains]);
    config.safe_mode = true;

    let (report, _) = run(
        config,
        "example.com",
        registry,
        Arc::new(ScriptedRunner::default()),
        CancellationToken::new(),
        dirs(&dir, "example.com"),
    )
    .await;

    let seen = seen.lock().clone();
    assert_eq!(seen, vec![(Phase::Osint, true), (Phase::Subdomains, true)]);
    assert!(report.policy_history.iter().all(|change| change.policy.safe_mode));
    assert_eq!(report.policy_history[0].policy.tool_threads, 1);
}

#[tokio::test]
async fn relax_is_the_only_way_out_of_safe_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir, &[Phase::Osint]);
    config.safe_mode = true;
    let (tx, mut rx) = events::channel();
    let mut coordinator = PhaseCoordinator::new(
        Arc::new(config),
        parse_target("example.com").unwrap(),
        dirs(&dir, "example.com"),
        PluginRegistry::empty(),
        Arc::new(ScriptedRunner::default()),
    )
    .unwrap()
    .with_events(tx);

    let controller = coordinator.controller();
    assert!(controller.current().safe_mode);

    coordinator.relax_policy("operator confirmed no WAF");
    assert!(!controller.current().safe_mode);
    assert_eq!(coordinator.target().host, "example.com");

    let report = coordinator.run(&[Phase::Osint]).await;
    assert!(report.policy_history.len() >= 2);
    assert!(!report.policy_history.last().unwrap().policy.safe_mode);
    let mut relaxed = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::PolicyChanged { safe_mode: false, reason, .. } = event {
            relaxed |= reason.contains("operator confirmed");
        }
    }
    assert!(relaxed);
}

#[tokio::test]
async fn each_phase_feeds_the_next_minus_exclusions() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = Arc::new(Mutex::new(BTreeMap::new()));
    let stub = |name, phase, stage, fanout, emit: Emit| {
        Arc::new(Stub {
            name,
            phase,
            stage,
            fanout,
            emit,
            inputs: Arc::clone(&inputs),
        })
    };

    let mut registry = PluginRegistry::empty();
    registry.register(stub("subs", Phase::Subdomains, Stage::Discover, Fanout::PerTarget, |_| {
        vec![
            Finding::subdomain("www.example.com", "subs").unwrap(),
            Finding::subdomain("api.example.com", "subs").unwrap(),
            Finding::subdomain("dev.example.com", "subs").unwrap(),
            verified("admin.example.com", "subs"),
        ]
    }));
    registry.register(stub("verify", Phase::Subdomains, Stage::Verify, Fanout::Batch, |host| {
        match host {
            "www.example.com" | "api.example.com" => vec![verified(host, "verify")],
            _ => Vec::new(),
        }
    }));
    registry.register(stub("ports", Phase::Ports, Stage::Discover, Fanout::PerTarget, |host| {
        let ports: &[u16] = match host {
            "www.example.com" => &[443],
            "api.example.com" => &[22, 8080],
            _ => &[],
        };
        ports
            .iter()
            .filter_map(|port| Finding::port(host, *port, Protocol::Tcp, "ports"))
            .collect()
    }));
    registry.register(stub("bust", Phase::Directories, Stage::Discover, Fanout::PerTarget, |base| {
        match base {
            "https://www.example.com" => {
                let mut found: Vec<Finding> = (0..12)
                    .map(|i| path(&format!("{base}/w{i}"), 200, 999))
                    .collect();
                found.push(path("https://www.example.com/panel", 200, 5000));
                found.push(path("https://www.example.com/old", 404, 10));
                found
            }
            "http://api.example.com:8080" => vec![path("http://api.example.com:8080/v1", 200, 321)],
            _ => Vec::new(),
        }
    }));
    registry.register(stub("crawl", Phase::Crawling, Stage::Discover, Fanout::Batch, |_| Vec::new()));

    let mut config = config(
        &dir,
        &[Phase::Subdomains, Phase::Ports, Phase::Directories, Phase::Crawling],
    );
    config.exclusions = vec!["admin.example.com".to_string()];

    let (report, _) = run(
        config,
        "example.com",
        registry,
        Arc::new(ScriptedRunner::default()),
        CancellationToken::new(),
        dirs(&dir, "example.com"),
    )
    .await;

    let seen = inputs.lock().clone();
    // the excluded host never reaches the verify stage
    assert_eq!(
        sorted(seen["verify"].clone()),
        vec!["api.example.com", "dev.example.com", "example.com", "www.example.com"]
    );
    // verified hosts only; the excluded one was verified but is dropped
    assert_eq!(sorted(seen["ports"].clone()), vec!["api.example.com", "www.example.com"]);
    // web ports only, ssh is not a base URL
    assert_eq!(
        sorted(seen["bust"].clone()),
        vec!["http://api.example.com:8080", "https://www.example.com"]
    );
    // base URLs plus live paths; wildcard and 404 paths are not seeds
    assert_eq!(
        sorted(seen["crawl"].clone()),
        vec![
            "http://api.example.com:8080",
            "http://api.example.com:8080/v1",
            "https://www.example.com",
            "https://www.example.com/panel",
        ]
    );

    for result in &report.phases {
        assert_eq!(result.status, PhaseStatus::Completed, "{}", result.phase);
    }
    assert_eq!(phase(&report, Phase::Directories).wildcard_signatures.len(), 1);
}

/// Serves a normal root page for the first `healthy` requests, then a block page.
struct FlippingSite {
    root_hits: AtomicUsize,
    healthy: usize,
}

#[async_trait]
impl HealthProbe for FlippingSite {
    async fn fetch(&self, url: &str) -> Option<ProbeResponse> {
        if !url.ends_with('/') {
            return Some(ProbeResponse::new(404, b"missing"));
        }
        let hit = self.root_hits.fetch_add(1, Ordering::SeqCst);
        Some(if hit < self.healthy {
            ProbeResponse::new(200, b"welcome")
        } else {
            ProbeResponse::new(403, b"blocked")
        })
    }
}

#[tokio::test]
async fn blocked_root_page_escalates_during_directory_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = PluginRegistry::empty();
    registry.register(Arc::new(Feroxbuster));
    let runner = ScriptedRunner::default()
        .with("feroxbuster", "200      GET       80l      300w     5120c https://example.com/admin\n")
        .slow(Duration::from_millis(300));
    let mut config = config(&dir, &[Phase::Directories]);
    config.adaptive.health_interval_ms = DelayRange { min_ms: 1, max_ms: 5 };
    let (tx, mut rx) = events::channel();

    let coordinator = PhaseCoordinator::new(
        Arc::new(config),
        parse_target("example.com").unwrap(),
        dirs(&dir, "example.com"),
        registry,
        Arc::new(runner),
    )
    .unwrap()
    .with_events(tx)
    .with_health_probe(Arc::new(FlippingSite {
        root_hits: AtomicUsize::new(0),
        healthy: 1,
    }));

    let report = coordinator.run(&[Phase::Directories]).await;

    let change = report
        .policy_history
        .iter()
        .find(|change| change.reason.contains("block detected"))
        .unwrap();
    assert!(change.policy.safe_mode);
    assert!(change.reason.contains("root page status 200 -> 403"));
    assert_eq!(change.phase, Some(Phase::Directories));

    let mut announced = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::PolicyChanged { safe_mode: true, reason, .. } = event {
            announced |= reason.contains("block detected");
        }
    }
    assert!(announced);
    // the run itself still finishes normally
    assert_eq!(phase(&report, Phase::Directories).status, PhaseStatus::Completed);
}

#[tokio::test]
async fn relax_keeps_the_detected_waf_in_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir, &[Phase::Osint]);
    config.waf_probe = true;
    let runner = ScriptedRunner::default().with(
        "wafw00f",
        "[+] The site https://example.com is behind Cloudflare (Cloudflare Inc.) WAF.\n",
    );
    let mut coordinator = PhaseCoordinator::new(
        Arc::new(config),
        parse_target("example.com").unwrap(),
        dirs(&dir, "example.com"),
        PluginRegistry::empty(),
        Arc::new(runner),
    )
    .unwrap();

    coordinator.probe_waf().await;
    assert!(coordinator.controller().current().safe_mode);
    coordinator.relax_policy("operator accepts the WAF");
    coordinator.run_phase(Phase::Osint, None).await;
    let report = coordinator.finalize();

    assert!(report.waf.detected);
    assert!(report.waf.probed);
    assert_eq!(report.waf.vendor.as_deref(), Some("Cloudflare"));
    assert!(!report.policy_history.last().unwrap().policy.safe_mode);
}
