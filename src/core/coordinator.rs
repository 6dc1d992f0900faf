//! Phase sequencing for one target.
//!
//! The coordinator owns the [`RunState`], derives each phase's input from the
//! results already committed to the store, runs the discover and verify
//! stages through the [`Scheduler`] and closes the run into a [`RunReport`].

use super::errors::{EngineError, Issue};
use super::events::{self, Event, EventReceiver, EventSender};
use super::findings::{Evidence, Finding};
use super::health::{HealthMonitor, HealthProbe};
use super::models::{Phase, RunDirs, Target};
use super::policy::{AdaptiveController, WafVerdict};
use super::scheduler::{RunOutcome, Scheduler, StageReport};
use super::scope::{ExclusionSet, lookup};
use super::state::{PhaseStatus, RunReport, RunState};
use super::store::{AggregationStore, PhaseResult};
use crate::config::EngineConfig;
use crate::executors::command::{CommandRunner, Termination};
use crate::plugins::types::{PhaseInput, Stage};
use crate::plugins::wafw00f::WafProbe;
use crate::plugins::PluginRegistry;
use crate::utils::time::new_run_id;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const WEB_PORTS: [u16; 9] = [80, 443, 8000, 8080, 8443, 8888, 3000, 5000, 9000];
const TLS_PORTS: [u16; 2] = [443, 8443];

const HTTPX_HOSTS: &str = "httpx-hosts";

pub struct PhaseCoordinator {
    config: Arc<EngineConfig>,
    target: Arc<Target>,
    dirs: RunDirs,
    registry: Arc<PluginRegistry>,
    runner: Arc<dyn CommandRunner>,
    controller: Arc<AdaptiveController>,
    store: Arc<AggregationStore>,
    scheduler: Scheduler,
    scheduler_events: EventReceiver,
    /// Sender side of `scheduler_events`, for health monitors.
    monitor_events: EventSender,
    health_probe: Option<Arc<dyn HealthProbe>>,
    exclusions: ExclusionSet,
    state: RunState,
    inputs: BTreeMap<Phase, Arc<PhaseInput>>,
    requested: Vec<Phase>,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl PhaseCoordinator {
    pub fn new(
        config: Arc<EngineConfig>,
        target: Target,
        dirs: RunDirs,
        registry: PluginRegistry,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, EngineError> {
        let exclusions = ExclusionSet::new(&config.exclusions)?;
        let controller = Arc::new(AdaptiveController::new(&config));
        let store = Arc::new(AggregationStore::new(config.wildcard.clone()));
        let (tx, rx) = events::channel();
        let scheduler = Scheduler::new(
            Arc::clone(&runner),
            Arc::clone(&controller),
            Arc::clone(&store),
            Arc::clone(&config),
        )
        .with_events(tx.clone());

        let mut state = RunState::new(String::new(), target.raw.clone());
        state.run_id = new_run_id(&target.raw, state.started_at);

        Ok(Self {
            config,
            target: Arc::new(target),
            dirs,
            registry: Arc::new(registry),
            runner,
            controller,
            store,
            scheduler,
            scheduler_events: rx,
            monitor_events: tx,
            health_probe: None,
            exclusions,
            state,
            inputs: BTreeMap::new(),
            requested: Vec::new(),
            events: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Share an abort signal with the caller (ctrl-c handler, tests).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Watch web origins for blocking while directory discovery runs.
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn controller(&self) -> Arc<AdaptiveController> {
        Arc::clone(&self.controller)
    }

    pub fn store(&self) -> Arc<AggregationStore> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Explicit user request to loosen the policy.
    pub fn relax_policy(&mut self, reason: &str) {
        let policy = self.controller.relax(reason);
        self.emit(Event::PolicyChanged {
            revision: policy.revision,
            reason: format!("relaxed by user: {reason}"),
            safe_mode: policy.safe_mode,
            concurrency: policy.concurrency_limit,
        });
    }

    fn emit(&mut self, event: Event) {
        forward(&mut self.state, self.events.as_ref(), event);
    }

    /// Run the requested phases in pipeline order and finalize.
    pub async fn run(mut self, phases: &[Phase]) -> RunReport {
        let mut phases = phases.to_vec();
        phases.sort();
        phases.dedup();
        self.requested = phases.clone();

        self.emit(Event::RunStarted {
            run_id: self.state.run_id.clone(),
            target: self.target.raw.clone(),
        });
        self.check_toolchain();
        self.probe_waf().await;

        for phase in phases {
            if self.cancel.is_cancelled() {
                tracing::warn!("Run aborted before {}", phase);
                break;
            }
            self.run_phase(phase, None).await;
        }
        self.finalize()
    }

    /// Record every enabled adapter whose binary is absent. Their ToolRuns
    /// are planned as skipped.
    pub fn check_toolchain(&mut self) {
        let missing: BTreeSet<String> = self
            .registry
            .missing_tools(&self.config, self.runner.as_ref())
            .into_iter()
            .map(|(adapter, program)| {
                tracing::warn!("{} unavailable: {} not found on PATH", adapter, program);
                program
            })
            .collect();
        self.state.missing_tools = missing.into_iter().collect();
    }

    /// One-shot WAF fingerprint before phase 0. Skipped when safe mode is
    /// already forced or probing is disabled.
    pub async fn probe_waf(&mut self) {
        if !self.config.waf_probe
            || self.config.safe_mode
            || !self.config.tool_enabled(WafProbe::NAME)
        {
            tracing::debug!("WAF probe skipped");
            return;
        }

        let program = self.config.program_for(WafProbe::NAME, WafProbe::NAME);
        if !self.runner.is_available(&program) {
            let err = EngineError::ToolMissing(program.clone());
            self.state
                .record_issue(Issue::from_error(&err).for_tool(WafProbe::NAME));
            if !self.state.missing_tools.contains(&program) {
                self.state.missing_tools.push(program);
                self.state.missing_tools.sort();
            }
            self.state.waf = WafVerdict::unknown();
            return;
        }

        let spec = WafProbe.build_invocation(&self.config, &self.target, &self.dirs.raw);
        tracing::info!("Probing for a WAF: {}", spec.display());
        let verdict = match self
            .runner
            .run(&spec, &self.cancel, self.config.abort_grace)
            .await
        {
            Ok(output) if output.termination == Termination::Exited => {
                let raw = self.dirs.raw.join("wafw00f.txt");
                if let Err(e) = tokio::fs::write(&raw, output.stdout.as_bytes()).await {
                    tracing::debug!("Cannot keep WAF probe output: {}", e);
                }
                WafProbe.parse(&output.stdout)
            }
            Ok(output) => {
                if output.termination == Termination::TimedOut {
                    let err = EngineError::ToolTimeout {
                        tool: WafProbe::NAME.to_string(),
                        seconds: spec.timeout.as_secs(),
                    };
                    self.state
                        .record_issue(Issue::from_error(&err).for_tool(WafProbe::NAME));
                }
                WafVerdict::unknown()
            }
            Err(e) => {
                self.state
                    .record_issue(Issue::from_error(&e).for_tool(WafProbe::NAME));
                WafVerdict::unknown()
            }
        };

        let before = self.controller.current().revision;
        let policy = self.controller.apply_waf_verdict(verdict.clone());
        if policy.revision != before {
            self.emit(Event::PolicyChanged {
                revision: policy.revision,
                reason: format!(
                    "WAF detected: {}",
                    verdict.vendor.as_deref().unwrap_or("unknown vendor")
                ),
                safe_mode: policy.safe_mode,
                concurrency: policy.concurrency_limit,
            });
        }
        self.state.waf = verdict;
    }

    /// Run one phase. `external` replaces the derived input, which is how a
    /// single out-of-order phase is requested.
    pub async fn run_phase(&mut self, phase: Phase, external: Option<Vec<String>>) -> PhaseStatus {
        if self.state.is_finalized() || self.cancel.is_cancelled() {
            return self.state.phase_status(phase);
        }
        if !self.requested.contains(&phase) {
            self.requested.push(phase);
            self.requested.sort();
        }

        let started = Instant::now();
        let items = match external {
            Some(items) => items,
            None => self.derive_items(phase),
        };
        let input = Arc::new(self.build_input(phase, items).await);
        self.inputs.insert(phase, Arc::clone(&input));

        if input.is_empty() {
            let err = EngineError::PhaseInputEmpty(phase);
            self.state.record_issue(Issue::from_error(&err).in_phase(phase));
            self.store.mark_skipped(phase);
            self.emit(Event::PhaseSkipped {
                phase,
                reason: err.to_string(),
            });
            return PhaseStatus::Skipped;
        }

        self.controller.begin_phase(phase);
        self.store.open_phase(phase, input.items.len());
        self.emit(Event::PhaseStarted {
            phase,
            planned: input.items.len(),
        });

        let monitors = self.start_health_monitors(phase, &input);
        let mut reports = Vec::new();
        let discover = self.run_stage(phase, Stage::Discover, input).await;
        let aborted = discover.aborted;
        let verify_input = (!aborted)
            .then(|| self.verify_input(phase, &discover))
            .flatten();
        reports.push(discover);

        if let Some(verify) = verify_input {
            reports.push(self.run_stage(phase, Stage::Verify, Arc::new(verify)).await);
        }
        if let Some(monitors) = monitors {
            self.stop_health_monitors(monitors).await;
        }

        let aborted = reports.iter().any(|r| r.aborted) || self.cancel.is_cancelled();
        let nothing_ran = reports
            .iter()
            .flat_map(|r| &r.runs)
            .all(|run| run.state == RunOutcome::Skipped);
        let status = if aborted {
            PhaseStatus::Aborted
        } else if nothing_ran || reports.iter().any(StageReport::any_degraded) {
            PhaseStatus::Partial
        } else {
            PhaseStatus::Completed
        };
        for issue in reports.into_iter().flat_map(|r| r.issues) {
            self.state.record_issue(issue);
        }

        self.store.close_phase(phase, status, started.elapsed());
        let findings = self
            .store
            .phase(phase)
            .map(|result| result.visible_findings().count())
            .unwrap_or(0);
        if aborted {
            let incomplete = self
                .store
                .phase(phase)
                .map(|result| result.incomplete_tools.into_iter().collect::<Vec<_>>())
                .unwrap_or_default();
            tracing::warn!(
                phase = %phase,
                "Aborted with incomplete tools: {}",
                incomplete.join(", ")
            );
        }
        self.emit(Event::PhaseFinished {
            phase,
            status,
            findings,
        });
        status
    }

    async fn run_stage(&mut self, phase: Phase, stage: Stage, input: Arc<PhaseInput>) -> StageReport {
        let adapters = self.registry.for_phase(phase, stage);
        if adapters.is_empty() {
            return StageReport::default();
        }

        let stage_run = self.scheduler.run_stage(
            &self.target,
            &self.dirs,
            phase,
            stage,
            &adapters,
            input,
            &self.cancel,
        );
        tokio::pin!(stage_run);

        // relay scheduler events while the stage runs so progress stays live
        let report = loop {
            tokio::select! {
                report = &mut stage_run => break report,
                Some(event) = self.scheduler_events.recv() => {
                    forward(&mut self.state, self.events.as_ref(), event);
                }
            }
        };
        while let Ok(event) = self.scheduler_events.try_recv() {
            forward(&mut self.state, self.events.as_ref(), event);
        }
        report
    }

    /// One monitor per web origin of the directory phase input.
    fn start_health_monitors(
        &self,
        phase: Phase,
        input: &PhaseInput,
    ) -> Option<(CancellationToken, JoinSet<()>)> {
        if phase != Phase::Directories || !self.config.adaptive.health_check {
            return None;
        }
        let probe = self.health_probe.as_ref()?;
        let origins: BTreeSet<String> = input
            .items
            .iter()
            .filter_map(|item| url::Url::parse(item).ok())
            .map(|url| url.origin().ascii_serialization())
            .filter(|origin| origin != "null")
            .collect();
        if origins.is_empty() {
            return None;
        }

        let interval = if self.controller.current().safe_mode {
            self.config.adaptive.safe_health_interval_ms
        } else {
            self.config.adaptive.health_interval_ms
        };
        let stop = self.cancel.child_token();
        let mut monitors = JoinSet::new();
        for origin in origins {
            let monitor = HealthMonitor::new(Arc::clone(probe), &origin, interval);
            tracing::info!(phase = %phase, "Watching {} for blocking responses", monitor.origin());
            monitors.spawn(monitor.watch(
                Arc::clone(&self.controller),
                Some(self.monitor_events.clone()),
                stop.clone(),
            ));
        }
        Some((stop, monitors))
    }

    async fn stop_health_monitors(&mut self, (stop, mut monitors): (CancellationToken, JoinSet<()>)) {
        stop.cancel();
        while let Some(joined) = monitors.join_next().await {
            if let Err(e) = joined {
                tracing::debug!("Health monitor ended abnormally: {}", e);
            }
        }
        while let Ok(event) = self.scheduler_events.try_recv() {
            forward(&mut self.state, self.events.as_ref(), event);
        }
    }

    /// Phase input before exclusions and resolution.
    fn derive_items(&self, phase: Phase) -> Vec<String> {
        match phase {
            Phase::Osint => vec![self.target.host.clone()],
            Phase::Subdomains => {
                if self.target.is_ip() {
                    Vec::new()
                } else {
                    vec![self.target.domain.clone()]
                }
            }
            Phase::Ports => self.port_scan_hosts(),
            Phase::Directories => self.web_base_urls(),
            Phase::Crawling => self.crawl_seeds(),
        }
    }

    /// Verified-active subdomains; every merged subdomain when the verify
    /// probe never succeeded; the target itself when phase 1 did not run.
    fn port_scan_hosts(&self) -> Vec<String> {
        let Some(result) = self.store.phase(Phase::Subdomains).filter(|r| !r.skipped) else {
            return vec![self.target.host.clone()];
        };
        let subdomains = || result.findings.values().filter_map(|f| match f {
            Finding::Subdomain(sub) => Some(sub),
            _ => None,
        });
        let verified: Vec<String> = subdomains()
            .filter(|sub| {
                sub.http_status
                    .as_ref()
                    .is_some_and(|status| status.evidence == Evidence::Verified)
            })
            .map(|sub| sub.host.clone())
            .collect();
        if verified.is_empty() && !result.tool_reached(HTTPX_HOSTS, RunOutcome::Succeeded) {
            tracing::info!("No verified subdomains, scanning every discovered host");
            return subdomains().map(|sub| sub.host.clone()).collect();
        }
        verified
    }

    fn web_base_urls(&self) -> Vec<String> {
        if let Some(ports) = self.store.phase(Phase::Ports).filter(|r| !r.skipped) {
            let urls: BTreeSet<String> = ports
                .findings
                .values()
                .filter_map(|finding| match finding {
                    Finding::Port(port) => {
                        let service = port.service.as_ref().map(|s| s.value.as_str());
                        web_url(&port.host, port.port, service)
                    }
                    _ => None,
                })
                .collect();
            return urls.into_iter().collect();
        }
        if let Some(subs) = self.store.phase(Phase::Subdomains).filter(|r| !r.skipped) {
            let urls: BTreeSet<String> = subs
                .findings
                .values()
                .filter_map(|finding| match finding {
                    Finding::Subdomain(sub) => sub
                        .url
                        .as_ref()
                        .filter(|url| url.evidence == Evidence::Verified)
                        .map(|url| url.value.clone()),
                    _ => None,
                })
                .collect();
            if !urls.is_empty() {
                return urls.into_iter().collect();
            }
        }
        vec![self.target.base_url()]
    }

    /// Phase 3 base URLs plus live (2xx, non-wildcard) paths, capped.
    fn crawl_seeds(&self) -> Vec<String> {
        let mut seeds: Vec<String> = match self.inputs.get(&Phase::Directories) {
            Some(input) if !input.is_empty() => input.items.clone(),
            _ => self.web_base_urls(),
        };
        if let Some(paths) = self.store.phase(Phase::Directories) {
            let mut live: Vec<String> = paths
                .visible_findings()
                .filter_map(|finding| match finding {
                    Finding::Path(path)
                        if path
                            .status_code
                            .as_ref()
                            .is_some_and(|s| (200..300).contains(&s.value)) =>
                    {
                        Some(path.url.clone())
                    }
                    _ => None,
                })
                .collect();
            live.sort();
            seeds.extend(live);
        }
        let mut seen = BTreeSet::new();
        seeds.retain(|seed| seen.insert(seed.clone()));
        seeds.truncate(self.config.scan.max_crawl_seeds.max(1));
        seeds
    }

    /// Apply exclusions, then attach the context a phase's adapters need.
    async fn build_input(&self, phase: Phase, items: Vec<String>) -> PhaseInput {
        let (mut items, excluded) = self.exclusions.retain_allowed(items);
        if !excluded.is_empty() {
            tracing::info!(phase = %phase, "Excluded {} inputs: {}", excluded.len(), excluded.join(", "));
        }
        let mut seen = BTreeSet::new();
        items.retain(|item| seen.insert(item.clone()));

        let mut input = PhaseInput::new(items);
        match phase {
            Phase::Ports => {
                input.resolved = self.resolve_hosts(&input.items).await;
                input.items = collapse_by_address(&input.items, &input.resolved);
            }
            Phase::Directories => {
                input.technologies = self.technologies();
            }
            _ => {}
        }
        input
    }

    fn technologies(&self) -> BTreeSet<String> {
        self.store
            .phase(Phase::Osint)
            .map(|result| {
                result
                    .findings
                    .values()
                    .filter_map(|finding| match finding {
                        Finding::Technology(tech) => Some(tech.name.to_ascii_lowercase()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Addresses from phase 1 probes first; DNS lookups for the rest when
    /// enabled.
    async fn resolve_hosts(&self, hosts: &[String]) -> BTreeMap<String, Vec<IpAddr>> {
        let mut known: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        if let Some(subs) = self.store.phase(Phase::Subdomains) {
            for finding in subs.findings.values() {
                if let Finding::Subdomain(sub) = finding {
                    if let Some(ip) = &sub.resolved_ip {
                        known.insert(sub.host.clone(), vec![ip.value]);
                    }
                }
            }
        }
        if !self.target.resolved.is_empty() {
            known.insert(self.target.host.clone(), self.target.resolved.clone());
        }

        let mut resolved: BTreeMap<String, Vec<IpAddr>> = hosts
            .iter()
            .filter_map(|host| {
                if let Ok(ip) = host.parse::<IpAddr>() {
                    return Some((host.clone(), vec![ip]));
                }
                known.get(host).map(|ips| (host.clone(), ips.clone()))
            })
            .collect();

        if self.config.scan.resolve_hosts {
            let pending: Vec<String> = hosts
                .iter()
                .filter(|host| !resolved.contains_key(*host))
                .cloned()
                .collect();
            let timeout = Duration::from_secs(5);
            let looked_up: Vec<(String, Vec<IpAddr>)> = stream::iter(pending)
                .map(|host| async move {
                    let ips = lookup(&host, timeout).await;
                    (host, ips)
                })
                .buffer_unordered(self.config.resolve_concurrency.max(1))
                .collect()
                .await;
            resolved.extend(looked_up.into_iter().filter(|(_, ips)| !ips.is_empty()));
        }
        resolved
    }

    /// Input for the verify stage, or `None` when there is nothing to verify.
    fn verify_input(&self, phase: Phase, discover: &StageReport) -> Option<PhaseInput> {
        if self.registry.for_phase(phase, Stage::Verify).is_empty() {
            return None;
        }
        let result = self.store.phase(phase)?;
        let base = self.inputs.get(&phase).map(|input| (**input).clone()).unwrap_or_default();

        let input = match phase {
            Phase::Subdomains => {
                let mut hosts: BTreeSet<String> = result
                    .findings
                    .values()
                    .filter_map(|f| f.host().map(str::to_string))
                    .collect();
                hosts.insert(self.target.domain.clone());
                let (allowed, _) = self.exclusions.retain_allowed(hosts.into_iter().collect());
                PhaseInput::new(allowed)
            }
            Phase::Ports => {
                let mut ports: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
                for finding in result.findings.values() {
                    if let Finding::Port(port) = finding {
                        ports.entry(port.host.clone()).or_default().insert(port.port);
                    }
                }
                let items = if discover.any_succeeded() {
                    ports.keys().cloned().collect()
                } else {
                    tracing::info!("No port discovery tool succeeded, nmap scans on its own");
                    base.items.clone()
                };
                let (allowed, _) = self.exclusions.retain_allowed(items);
                PhaseInput {
                    items: allowed,
                    ports,
                    ..base
                }
            }
            Phase::Directories => {
                let urls = visible_paths(&result);
                let (allowed, _) = self.exclusions.retain_allowed(urls);
                PhaseInput {
                    items: allowed,
                    ..base
                }
            }
            Phase::Osint | Phase::Crawling => return None,
        };
        (!input.is_empty()).then_some(input)
    }

    /// Close the run and hand back the fully populated result.
    pub fn finalize(mut self) -> RunReport {
        let aborted = self.cancel.is_cancelled();
        let status = self.state.finalize(aborted);
        forward(&mut self.state, self.events.as_ref(), Event::RunFinished { status });

        let mut phases = self.store.snapshot();
        for phase in &self.requested {
            if !phases.iter().any(|result| result.phase == *phase) {
                phases.push(PhaseResult::new(*phase));
            }
        }
        phases.sort_by_key(|result| result.phase);

        RunReport {
            run_id: self.state.run_id.clone(),
            target: self.target.raw.clone(),
            status,
            started_at: self.state.started_at,
            finished_at: self.state.finished_at,
            waf: self.controller.waf(),
            policy_history: self.controller.history(),
            phases,
            issues: self.state.issues.clone(),
            missing_tools: self.state.missing_tools.clone(),
        }
    }
}

fn forward(state: &mut RunState, events: Option<&EventSender>, event: Event) {
    state.on_event(&event);
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn visible_paths(result: &PhaseResult) -> Vec<String> {
    result
        .visible_findings()
        .filter_map(|finding| match finding {
            Finding::Path(path) => Some(path.url.clone()),
            _ => None,
        })
        .collect()
}

/// `scheme://host[:port]` for web-like services, `None` otherwise.
fn web_url(host: &str, port: u16, service: Option<&str>) -> Option<String> {
    let service = service.unwrap_or_default().to_ascii_lowercase();
    if !service.contains("http") && !WEB_PORTS.contains(&port) {
        return None;
    }
    let tls = TLS_PORTS.contains(&port) || service.contains("ssl") || service.contains("https");
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    Some(match (tls, port) {
        (true, 443) => format!("https://{host}"),
        (false, 80) => format!("http://{host}"),
        (true, port) => format!("https://{host}:{port}"),
        (false, port) => format!("http://{host}:{port}"),
    })
}

/// Keep the first host (in sorted order) per address; hosts whose addresses
/// were all seen already are dropped. Unresolved hosts are always kept.
fn collapse_by_address(hosts: &[String], resolved: &BTreeMap<String, Vec<IpAddr>>) -> Vec<String> {
    let mut sorted: Vec<&String> = hosts.iter().collect();
    sorted.sort();
    let mut seen: BTreeSet<IpAddr> = BTreeSet::new();
    let mut kept = Vec::new();
    for host in sorted {
        match resolved.get(host).filter(|ips| !ips.is_empty()) {
            Some(ips) => {
                if ips.iter().all(|ip| seen.contains(ip)) {
                    tracing::debug!("{} shares its address with an earlier host, collapsed", host);
                    continue;
                }
                seen.extend(ips.iter().copied());
                kept.push(host.clone());
            }
            None => kept.push(host.clone()),
        }
    }
    kept
}
