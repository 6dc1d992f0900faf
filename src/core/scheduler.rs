//! Bounded worker pool for one stage of one phase.
//!
//! Work units are planned up front, dispatched cheapest first into a
//! `JoinSet` whose in-flight count follows the *current* policy, and
//! collected by a single loop that is the only writer into the store.

use super::errors::{EngineError, ExecError, Issue, IssueKind};
use super::events::{Event, EventSender};
use super::findings::Finding;
use super::models::{Phase, RunDirs, Target};
use super::policy::{AdaptiveController, Policy, ResponseFilter};
use super::store::AggregationStore;
use crate::config::EngineConfig;
use crate::executors::command::{CommandRunner, Termination};
use crate::plugins::types::{Fanout, PhaseInput, RawOutput, Stage, ToolAdapter, ToolContext, WorkUnit};
use crate::utils::fs::{remove_quietly, write_lines};
use crate::utils::time::sanitize_target;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Lines of stderr kept when a tool exits non-zero.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Pending,
    Running,
    Succeeded,
    /// Spawn error or non-zero exit; whatever stdout there was is still parsed.
    Failed,
    TimedOut,
    /// Prerequisite unmet (binary absent, no applicable input). Not an error.
    Skipped,
    /// Aborted before dispatch, or killed after the grace period.
    Cancelled,
}

impl RunOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunOutcome::Pending | RunOutcome::Running)
    }

    pub fn is_error(self) -> bool {
        matches!(self, RunOutcome::Failed | RunOutcome::TimedOut)
    }
}

/// One invocation of one adapter on one work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool: String,
    pub unit: String,
    pub phase: Phase,
    pub stage: Stage,
    pub state: RunOutcome,
    pub command: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Raw stdout kept for audit under `raw/phaseN_*`.
    pub raw_output: Option<PathBuf>,
    pub findings: usize,
    pub parse_degraded: bool,
    pub policy_revision: Option<u32>,
    pub error: Option<String>,
}

impl ToolRun {
    pub fn new(tool: impl Into<String>, unit: impl Into<String>, phase: Phase, stage: Stage) -> Self {
        Self {
            tool: tool.into(),
            unit: unit.into(),
            phase,
            stage,
            state: RunOutcome::Pending,
            command: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            raw_output: None,
            findings: 0,
            parse_degraded: false,
            policy_revision: None,
            error: None,
        }
    }

    /// `pending -> running -> terminal`, with `skipped`/`cancelled` also
    /// reachable straight from `pending`. Other moves are refused.
    pub fn transition(&mut self, next: RunOutcome) -> bool {
        use RunOutcome::*;
        let allowed = match (self.state, next) {
            (Pending, Running | Skipped | Cancelled) => true,
            (Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            tracing::warn!(
                tool = %self.tool,
                unit = %self.unit,
                "Refused ToolRun transition {:?} -> {:?}",
                self.state,
                next
            );
            return false;
        }
        match next {
            Running => self.started_at = Some(Utc::now()),
            _ => self.finished_at = Some(Utc::now()),
        }
        self.state = next;
        true
    }

    fn skipped(
        tool: &str,
        unit: &str,
        phase: Phase,
        stage: Stage,
        reason: impl Into<String>,
    ) -> Self {
        let mut run = Self::new(tool, unit, phase, stage);
        run.error = Some(reason.into());
        run.transition(RunOutcome::Skipped);
        run
    }
}

/// What one stage produced, for the coordinator's phase status.
#[derive(Debug, Default)]
pub struct StageReport {
    pub runs: Vec<ToolRun>,
    pub issues: Vec<Issue>,
    pub aborted: bool,
}

impl StageReport {
    pub fn any_degraded(&self) -> bool {
        self.runs
            .iter()
            .any(|run| run.state.is_error() || run.parse_degraded)
    }

    pub fn succeeded(&self, tool: &str) -> bool {
        self.runs
            .iter()
            .any(|run| run.tool == tool && run.state == RunOutcome::Succeeded)
    }

    pub fn any_succeeded(&self) -> bool {
        self.runs.iter().any(|run| run.state == RunOutcome::Succeeded)
    }
}

struct Job {
    adapter: Arc<dyn ToolAdapter>,
    unit: WorkUnit,
    program: String,
}

struct Finished {
    run: ToolRun,
    findings: Vec<Finding>,
    issues: Vec<Issue>,
}

/// Everything a spawned task needs, cloned once per dispatch.
#[derive(Clone)]
struct TaskEnv {
    runner: Arc<dyn CommandRunner>,
    config: Arc<EngineConfig>,
    target: Arc<Target>,
    input: Arc<PhaseInput>,
    raw_dir: PathBuf,
    phase: Phase,
    stage: Stage,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl TaskEnv {
    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct Scheduler {
    runner: Arc<dyn CommandRunner>,
    controller: Arc<AdaptiveController>,
    store: Arc<AggregationStore>,
    config: Arc<EngineConfig>,
    events: Option<EventSender>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        controller: Arc<AdaptiveController>,
        store: Arc<AggregationStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            runner,
            controller,
            store,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run every adapter of one stage over `input` and commit what they find.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_stage(
        &self,
        target: &Arc<Target>,
        dirs: &RunDirs,
        phase: Phase,
        stage: Stage,
        adapters: &[Arc<dyn ToolAdapter>],
        input: Arc<PhaseInput>,
        cancel: &CancellationToken,
    ) -> StageReport {
        let mut report = StageReport::default();
        let (jobs, skipped) = self.plan(dirs, phase, stage, adapters, &input, &mut report.issues);
        for run in skipped {
            self.record(phase, run, Vec::new(), &mut report);
        }

        let env = TaskEnv {
            runner: Arc::clone(&self.runner),
            config: Arc::clone(&self.config),
            target: Arc::clone(target),
            input,
            raw_dir: dirs.phase_raw(phase),
            phase,
            stage,
            cancel: cancel.clone(),
            events: self.events.clone(),
        };
        if let Err(e) = tokio::fs::create_dir_all(&env.raw_dir).await {
            tracing::warn!("Cannot create {:?}: {}", env.raw_dir, e);
        }

        let mut pending: VecDeque<Job> = jobs.into();
        let mut in_flight: JoinSet<Finished> = JoinSet::new();

        loop {
            if !report.aborted && cancel.is_cancelled() {
                report.aborted = true;
            }
            while !report.aborted {
                // re-read so a tightened policy applies to runs not yet started
                let policy = self.controller.current();
                if in_flight.len() >= policy.concurrency_limit.max(1) {
                    break;
                }
                let Some(job) = pending.pop_front() else {
                    break;
                };
                let env = env.clone();
                in_flight.spawn(async move {
                    let tool = job.adapter.name();
                    let label = job.unit.label.clone();
                    let (phase, stage) = (env.phase, env.stage);
                    let scratch = [job.unit.list_file.clone(), job.unit.output_file.clone()];
                    AssertUnwindSafe(execute(job, policy, env))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            tracing::error!(tool, unit = %label, "Tool task panicked");
                            for path in scratch.iter().flatten() {
                                remove_quietly(path);
                            }
                            let mut run = ToolRun::new(tool, &label, phase, stage);
                            run.transition(RunOutcome::Running);
                            run.transition(RunOutcome::Failed);
                            run.error = Some("adapter panicked".to_string());
                            Finished {
                                run,
                                findings: Vec::new(),
                                issues: Vec::new(),
                            }
                        })
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(done)) => {
                        report.issues.extend(done.issues);
                        self.record(phase, done.run, done.findings, &mut report);
                    }
                    Some(Err(e)) => tracing::error!("Tool task failed to join: {}", e),
                    None => {}
                },
                _ = cancel.cancelled(), if !report.aborted => {
                    tracing::warn!(phase = %phase, "Abort requested, no further tools will start");
                    report.aborted = true;
                }
            }
        }

        for job in pending {
            let mut run = ToolRun::new(job.adapter.name(), &job.unit.label, phase, stage);
            run.transition(RunOutcome::Cancelled);
            run.error = Some("not started before abort".to_string());
            if let Some(list) = &job.unit.list_file {
                remove_quietly(list);
            }
            self.record(phase, run, Vec::new(), &mut report);
        }

        report
    }

    /// Expand adapters into work units. Units that cannot run are returned
    /// as already-skipped runs.
    fn plan(
        &self,
        dirs: &RunDirs,
        phase: Phase,
        stage: Stage,
        adapters: &[Arc<dyn ToolAdapter>],
        input: &PhaseInput,
        issues: &mut Vec<Issue>,
    ) -> (Vec<Job>, Vec<ToolRun>) {
        let mut jobs = Vec::new();
        let mut skipped = Vec::new();

        for adapter in adapters {
            let name = adapter.name();
            let program = self.config.program_for(name, adapter.binary());
            if !self.runner.is_available(&program) {
                let err = EngineError::ToolMissing(program.clone());
                issues.push(Issue::from_error(&err).in_phase(phase).for_tool(name));
                skipped.push(ToolRun::skipped(name, "-", phase, stage, err.to_string()));
                continue;
            }

            // inputs sharing a unit key run together; first one wins the label
            let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
            let mut order = Vec::new();
            for item in &input.items {
                if !adapter.accepts(item, input) {
                    tracing::debug!(tool = name, "Input {} not applicable", item);
                    continue;
                }
                let key = adapter.unit_key(item);
                let group = groups.entry(key.clone()).or_default();
                if group.is_empty() {
                    order.push(key);
                }
                if !group.contains(item) {
                    group.push(item.clone());
                }
            }
            if order.is_empty() {
                skipped.push(ToolRun::skipped(name, "-", phase, stage, "no applicable input"));
                continue;
            }

            let sink = |label: &str| {
                adapter
                    .output_sink()
                    .map(|ext| dirs.tmp.join(format!("{}_{}_{}.{}", phase.dir_name(), name, label, ext)))
            };

            match adapter.fanout() {
                Fanout::PerTarget => {
                    for key in order {
                        let label = sanitize_target(&key);
                        let inputs = groups.remove(&key).unwrap_or_default();
                        jobs.push(Job {
                            adapter: Arc::clone(adapter),
                            unit: WorkUnit {
                                output_file: sink(&label),
                                label,
                                inputs,
                                list_file: None,
                            },
                            program: program.clone(),
                        });
                    }
                }
                Fanout::Batch => {
                    let inputs: Vec<String> = order
                        .iter()
                        .filter_map(|key| groups.get(key))
                        .flatten()
                        .cloned()
                        .collect();
                    let list = dirs.tmp.join(format!("{}_{}_inputs.txt", phase.dir_name(), name));
                    if let Err(e) = write_lines(&list, &inputs) {
                        issues.push(
                            Issue::new(IssueKind::Io, format!("cannot write input list: {:#}", e))
                                .in_phase(phase)
                                .for_tool(name),
                        );
                        skipped.push(ToolRun::skipped(name, "batch", phase, stage, "input list not writable"));
                        continue;
                    }
                    jobs.push(Job {
                        adapter: Arc::clone(adapter),
                        unit: WorkUnit {
                            output_file: sink("batch"),
                            label: "batch".to_string(),
                            inputs,
                            list_file: Some(list),
                        },
                        program,
                    });
                }
            }
        }

        jobs.sort_by(|a, b| {
            (a.adapter.cost_hint(), a.adapter.name(), &a.unit.label)
                .cmp(&(b.adapter.cost_hint(), b.adapter.name(), &b.unit.label))
        });
        tracing::debug!(
            phase = %phase,
            "Planned {} work units ({} skipped) for {:?} stage",
            jobs.len(),
            skipped.len(),
            stage
        );
        (jobs, skipped)
    }

    /// Single writer: commit one terminal run and feed the controller.
    fn record(&self, phase: Phase, run: ToolRun, findings: Vec<Finding>, report: &mut StageReport) {
        let outcome = run.state;
        let found = findings.len();
        self.emit(Event::ToolFinished {
            phase,
            tool: run.tool.clone(),
            unit: run.unit.clone(),
            outcome,
            findings: found,
        });
        report.runs.push(run.clone());

        let commit = self.store.commit(phase, run, findings);
        let mut changed = self.controller.record_outcome(outcome);
        for signature in commit.new_signatures {
            tracing::info!(
                host = %signature.host,
                "Wildcard signature: status {} length {}-{} ({}/{} paths)",
                signature.status,
                signature.length_min,
                signature.length_max,
                signature.matched,
                signature.host_total
            );
            self.controller.record_wildcard(ResponseFilter {
                host: signature.host,
                status: signature.status,
                length_min: signature.length_min,
                length_max: signature.length_max,
            });
            changed = true;
        }
        if changed {
            let policy = self.controller.current();
            let reason = self
                .controller
                .history()
                .last()
                .map(|change| change.reason.clone())
                .unwrap_or_default();
            self.emit(Event::PolicyChanged {
                revision: policy.revision,
                reason,
                safe_mode: policy.safe_mode,
                concurrency: policy.concurrency_limit,
            });
        }
    }
}

/// Body of one worker: jitter, build, run, keep raw output, parse, clean up.
async fn execute(job: Job, policy: Arc<Policy>, env: TaskEnv) -> Finished {
    let Job {
        adapter,
        unit,
        program,
    } = job;
    let tool = adapter.name();
    let mut run = ToolRun::new(tool, &unit.label, env.phase, env.stage);
    run.policy_revision = Some(policy.revision);
    let mut issues = Vec::new();

    let ctx = ToolContext {
        target: Arc::clone(&env.target),
        config: Arc::clone(&env.config),
        input: Arc::clone(&env.input),
        unit,
        program,
        cwd: env.raw_dir.clone(),
    };
    let cleanup = |ctx: &ToolContext| {
        if let Some(path) = &ctx.unit.output_file {
            remove_quietly(path);
        }
        if let Some(path) = &ctx.unit.list_file {
            remove_quietly(path);
        }
    };

    let jitter = policy.jitter();
    if !jitter.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = env.cancel.cancelled() => {
                run.transition(RunOutcome::Cancelled);
                cleanup(&ctx);
                return Finished { run, findings: Vec::new(), issues };
            }
        }
    }

    let mut spec = match adapter.build_invocation(&ctx, &policy) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::warn!(tool, unit = %ctx.unit.label, "Cannot build invocation: {}", e);
            issues.push(Issue::from_error(&e).in_phase(env.phase).for_tool(tool));
            run.error = Some(e.to_string());
            run.transition(RunOutcome::Skipped);
            cleanup(&ctx);
            return Finished { run, findings: Vec::new(), issues };
        }
    };

    let tool_config = env.config.tool(tool);
    spec.args.extend(tool_config.extra_args.iter().cloned());
    if let Some(seconds) = tool_config.timeout_s {
        let multiplier = if policy.safe_mode {
            u64::from(env.config.adaptive.safe_timeout_multiplier.max(1))
        } else {
            1
        };
        spec.timeout = Duration::from_secs(seconds.saturating_mul(multiplier));
    }
    if spec.output_file.is_none() {
        spec.output_file = ctx.unit.output_file.clone();
    }

    run.command = Some(spec.display());
    run.transition(RunOutcome::Running);
    env.emit(Event::ToolStarted {
        phase: env.phase,
        tool: tool.to_string(),
        unit: ctx.unit.label.clone(),
    });
    tracing::info!(tool, unit = %ctx.unit.label, phase = %env.phase, "Running: {}", spec.display());

    let output = match env
        .runner
        .run(&spec, &env.cancel, env.config.abort_grace)
        .await
    {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(tool, unit = %ctx.unit.label, "Failed to start: {}", e);
            issues.push(Issue::from_error(&e).in_phase(env.phase).for_tool(tool));
            run.error = Some(e.to_string());
            run.transition(RunOutcome::Failed);
            cleanup(&ctx);
            return Finished { run, findings: Vec::new(), issues };
        }
    };
    run.exit_code = output.exit_code;

    let outcome = match output.termination {
        Termination::Cancelled => RunOutcome::Cancelled,
        Termination::TimedOut => {
            let err = EngineError::ToolTimeout {
                tool: tool.to_string(),
                seconds: spec.timeout.as_secs(),
            };
            issues.push(Issue::from_error(&err).in_phase(env.phase).for_tool(tool));
            run.error = Some(err.to_string());
            RunOutcome::TimedOut
        }
        Termination::Exited if output.success() => RunOutcome::Succeeded,
        Termination::Exited => {
            let err = EngineError::ToolCrashed(ExecError {
                tool: tool.to_string(),
                args: spec.args.clone(),
                cwd: spec.cwd.display().to_string(),
                exit_code: output.exit_code,
                stderr_tail: ExecError::tail(&output.stderr, STDERR_TAIL_LINES),
                duration_ms: output.duration_ms,
            });
            issues.push(Issue::from_error(&err).in_phase(env.phase).for_tool(tool));
            run.error = Some(err.to_string());
            RunOutcome::Failed
        }
    };

    if outcome == RunOutcome::Cancelled {
        tracing::info!(tool, unit = %ctx.unit.label, "Cancelled, output discarded");
        run.transition(outcome);
        cleanup(&ctx);
        return Finished { run, findings: Vec::new(), issues };
    }

    let raw_path = env
        .raw_dir
        .join(format!("{}_{}.txt", tool, ctx.unit.label));
    match tokio::fs::write(&raw_path, output.stdout.as_bytes()).await {
        Ok(()) => run.raw_output = Some(raw_path),
        Err(e) => tracing::debug!("Cannot keep raw output {:?}: {}", raw_path, e),
    }

    let sink = match &ctx.unit.output_file {
        Some(path) => tokio::fs::read_to_string(path).await.ok(),
        None => None,
    };
    let raw = RawOutput {
        stdout: output.stdout,
        sink,
    };
    let parsed = adapter.parse(&raw, &ctx);
    cleanup(&ctx);

    if parsed.degraded {
        let err = EngineError::ParseDegraded {
            tool: tool.to_string(),
            detail: format!("{} lines could not be read", parsed.skipped_lines),
        };
        tracing::warn!(tool, unit = %ctx.unit.label, "{}", err);
        issues.push(Issue::from_error(&err).in_phase(env.phase).for_tool(tool));
        run.parse_degraded = true;
    }
    run.findings = parsed.findings.len();
    run.transition(outcome);
    tracing::info!(
        tool,
        unit = %ctx.unit.label,
        "Finished {:?} with {} findings",
        outcome,
        run.findings
    );

    Finished {
        run,
        findings: parsed.findings,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::core::scope::parse_target;
    use crate::executors::command::{CommandOutput, CommandSpec};
    use crate::plugins::types::{ParseOutcome, parse_lines};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Echoes `host` lines back as subdomains; `fail.*` inputs exit 1.
    struct LineAdapter {
        name: &'static str,
        cost: u32,
        fanout: Fanout,
    }

    impl ToolAdapter for LineAdapter {
        fn name(&self) -> &'static str {
            self.name
        }
        fn binary(&self) -> &'static str {
            self.name
        }
        fn phase(&self) -> Phase {
            Phase::Subdomains
        }
        fn fanout(&self) -> Fanout {
            self.fanout
        }
        fn cost_hint(&self) -> u32 {
            self.cost
        }
        fn build_invocation(
            &self,
            ctx: &ToolContext,
            policy: &Policy,
        ) -> Result<CommandSpec, EngineError> {
            Ok(ctx.command(policy).args(ctx.unit.inputs.clone()))
        }
        fn parse(&self, raw: &RawOutput, _ctx: &ToolContext) -> ParseOutcome {
            parse_lines(&raw.stdout, |line| {
                Some(Finding::subdomain(line, self.name).into_iter().collect())
            })
        }
    }

    #[derive(Default)]
    struct EchoRunner {
        missing: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for EchoRunner {
        fn is_available(&self, program: &str) -> bool {
            !self.missing.contains(&program)
        }

        async fn run(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
            _grace: Duration,
        ) -> Result<CommandOutput, EngineError> {
            self.calls.lock().push(spec.display());
            let failing = spec.args.iter().any(|a| a.starts_with("fail."));
            Ok(CommandOutput {
                stdout: spec.args.join("\n"),
                stderr: if failing { "boom".into() } else { String::new() },
                exit_code: Some(if failing { 1 } else { 0 }),
                duration_ms: 1,
                termination: Termination::Exited,
            })
        }
    }

    /// Waits for the abort, then exits normally with its inputs as output.
    struct FinishOnAbortRunner;

    #[async_trait]
    impl CommandRunner for FinishOnAbortRunner {
        fn is_available(&self, _program: &str) -> bool {
            true
        }

        async fn run(
            &self,
            spec: &CommandSpec,
            cancel: &CancellationToken,
            _grace: Duration,
        ) -> Result<CommandOutput, EngineError> {
            cancel.cancelled().await;
            Ok(CommandOutput {
                stdout: spec.args.join("\n"),
                stderr: String::new(),
                exit_code: Some(0),
                duration_ms: 1,
                termination: Termination::Exited,
            })
        }
    }

    /// Batch adapter that panics while building its command line.
    struct PanickingAdapter;

    impl ToolAdapter for PanickingAdapter {
        fn name(&self) -> &'static str {
            "panicky"
        }
        fn binary(&self) -> &'static str {
            "panicky"
        }
        fn phase(&self) -> Phase {
            Phase::Subdomains
        }
        fn fanout(&self) -> Fanout {
            Fanout::Batch
        }
        fn cost_hint(&self) -> u32 {
            1
        }
        fn output_sink(&self) -> Option<&'static str> {
            Some("json")
        }
        fn build_invocation(
            &self,
            _ctx: &ToolContext,
            _policy: &Policy,
        ) -> Result<CommandSpec, EngineError> {
            panic!("adapter bug")
        }
        fn parse(&self, _raw: &RawOutput, _ctx: &ToolContext) -> ParseOutcome {
            ParseOutcome::new(Vec::new(), 0, 0)
        }
    }

    fn setup(runner: EchoRunner) -> (Scheduler, Arc<AggregationStore>, RunDirs, tempfile::TempDir) {
        setup_with(runner, |_| {})
    }

    fn setup_with(
        runner: impl CommandRunner + 'static,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> (Scheduler, Arc<AggregationStore>, RunDirs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dirs = RunDirs {
            root: dir.path().to_path_buf(),
            raw: dir.path().join("raw"),
            tmp: dir.path().join("tmp"),
            report: dir.path().join("report"),
        };
        std::fs::create_dir_all(&dirs.tmp).unwrap();
        let mut config = EngineConfig::new(GlobalConfig::default(), dir.path());
        tweak(&mut config);
        let config = Arc::new(config);
        let controller = Arc::new(AdaptiveController::new(&config));
        let store = Arc::new(AggregationStore::new(config.wildcard.clone()));
        let scheduler = Scheduler::new(Arc::new(runner), controller, Arc::clone(&store), config);
        (scheduler, store, dirs, dir)
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let mut run = ToolRun::new("ffuf", "u", Phase::Directories, Stage::Discover);
        assert!(!run.transition(RunOutcome::Succeeded));
        assert!(run.transition(RunOutcome::Running));
        assert!(run.started_at.is_some());
        assert!(run.transition(RunOutcome::TimedOut));
        assert!(!run.transition(RunOutcome::Running));
        assert_eq!(run.state, RunOutcome::TimedOut);

        let mut skipped = ToolRun::new("ffuf", "u", Phase::Directories, Stage::Discover);
        assert!(skipped.transition(RunOutcome::Skipped));
        assert!(skipped.finished_at.is_some());
    }

    #[tokio::test]
    async fn failures_are_isolated_and_recorded() {
        let (scheduler, store, dirs, _dir) = setup(EchoRunner {
            missing: vec!["ghost"],
            ..Default::default()
        });
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(LineAdapter { name: "echo", cost: 10, fanout: Fanout::PerTarget }),
            Arc::new(LineAdapter { name: "ghost", cost: 5, fanout: Fanout::PerTarget }),
        ];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(vec!["a.example.com".into(), "fail.example.com".into()]));
        store.open_phase(Phase::Subdomains, 2);

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Discover, &adapters, input, &CancellationToken::new())
            .await;

        assert!(!report.aborted);
        let outcomes: Vec<(String, RunOutcome)> = report
            .runs
            .iter()
            .map(|r| (format!("{}:{}", r.tool, r.unit), r.state))
            .collect();
        assert!(outcomes.contains(&("ghost:-".to_string(), RunOutcome::Skipped)));
        assert!(outcomes.contains(&("echo:a.example.com".to_string(), RunOutcome::Succeeded)));
        assert!(outcomes.contains(&("echo:fail.example.com".to_string(), RunOutcome::Failed)));
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::ToolMissing));
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::ToolCrashed));
        assert!(report.any_degraded());

        // the failed run's stdout is still parsed
        let result = store.phase(Phase::Subdomains).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.tools_failed.contains("echo"));
        assert!(result.tools_skipped.contains("ghost"));
        assert!(dirs.phase_raw(Phase::Subdomains).join("echo_a.example.com.txt").exists());
    }

    #[tokio::test]
    async fn batch_units_share_a_list_file_that_is_removed() {
        let runner = EchoRunner::default();
        let (scheduler, store, dirs, _dir) = setup(runner);
        let adapters: Vec<Arc<dyn ToolAdapter>> =
            vec![Arc::new(LineAdapter { name: "batcher", cost: 1, fanout: Fanout::Batch })];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(vec![
            "a.example.com".into(),
            "b.example.com".into(),
            "a.example.com".into(),
        ]));

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Verify, &adapters, input, &CancellationToken::new())
            .await;

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].unit, "batch");
        assert_eq!(store.phase(Phase::Subdomains).unwrap().len(), 2);
        let leftovers: Vec<_> = std::fs::read_dir(&dirs.tmp).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_dispatch_runs_nothing() {
        let (scheduler, store, dirs, _dir) = setup(EchoRunner::default());
        let adapters: Vec<Arc<dyn ToolAdapter>> =
            vec![Arc::new(LineAdapter { name: "echo", cost: 1, fanout: Fanout::PerTarget })];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(vec!["a.example.com".into()]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Discover, &adapters, input, &cancel)
            .await;

        assert!(report.aborted);
        assert_eq!(report.runs[0].state, RunOutcome::Cancelled);
        let result = store.phase(Phase::Subdomains).unwrap();
        assert!(result.incomplete_tools.contains("echo"));
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn runs_that_finish_during_the_grace_period_are_committed() {
        let (scheduler, store, dirs, _dir) = setup_with(FinishOnAbortRunner, |_| {});
        let adapters: Vec<Arc<dyn ToolAdapter>> =
            vec![Arc::new(LineAdapter { name: "echo", cost: 1, fanout: Fanout::PerTarget })];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(vec!["a.example.com".into()]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Discover, &adapters, input, &cancel)
            .await;

        assert!(report.aborted);
        assert_eq!(report.runs[0].state, RunOutcome::Succeeded);
        let result = store.phase(Phase::Subdomains).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.tools_run.contains("echo"));
        assert!(result.incomplete_tools.is_empty());
    }

    #[tokio::test]
    async fn panicking_adapter_fails_and_leaves_no_scratch_files() {
        let (scheduler, store, dirs, _dir) = setup(EchoRunner::default());
        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![Arc::new(PanickingAdapter)];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(vec!["a.example.com".into(), "b.example.com".into()]));

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Discover, &adapters, input, &CancellationToken::new())
            .await;

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].state, RunOutcome::Failed);
        assert_eq!(report.runs[0].error.as_deref(), Some("adapter panicked"));
        assert!(store.phase(Phase::Subdomains).unwrap().tools_failed.contains("panicky"));
        let leftovers: Vec<_> = std::fs::read_dir(&dirs.tmp).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn later_runs_start_under_the_tightened_policy() {
        let (scheduler, _store, dirs, _dir) = setup_with(EchoRunner::default(), |config| {
            config.threads = 1;
            config.adaptive.safe_delay_ms = crate::config::DelayRange::ZERO;
        });
        let adapters: Vec<Arc<dyn ToolAdapter>> =
            vec![Arc::new(LineAdapter { name: "echo", cost: 1, fanout: Fanout::PerTarget })];
        let target = Arc::new(parse_target("example.com").unwrap());
        let input = Arc::new(PhaseInput::new(
            ["fail.a", "fail.b", "fail.c", "fail.d", "z1", "z2"]
                .iter()
                .map(|label| format!("{label}.example.com"))
                .collect(),
        ));

        let report = scheduler
            .run_stage(&target, &dirs, Phase::Subdomains, Stage::Discover, &adapters, input, &CancellationToken::new())
            .await;

        let revisions: Vec<(String, Option<u32>)> = report
            .runs
            .iter()
            .map(|run| (run.unit.clone(), run.policy_revision))
            .collect();
        assert_eq!(
            revisions,
            vec![
                ("fail.a.example.com".to_string(), Some(0)),
                ("fail.b.example.com".to_string(), Some(0)),
                ("fail.c.example.com".to_string(), Some(0)),
                ("fail.d.example.com".to_string(), Some(0)),
                ("z1.example.com".to_string(), Some(1)),
                ("z2.example.com".to_string(), Some(1)),
            ]
        );
        let history = scheduler.controller.history();
        let tightened = history.iter().find(|change| change.revision == 1).unwrap();
        assert!(tightened.policy.safe_mode);
        assert!(!history[0].policy.safe_mode);
    }
}
