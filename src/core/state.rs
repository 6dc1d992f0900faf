use super::errors::Issue;
use super::events::Event;
use super::models::Phase;
use super::policy::{PolicyChange, WafVerdict};
use super::scheduler::RunOutcome;
use super::store::PhaseResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    /// Finished, but at least one phase is partial or skipped.
    Partial,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Completed,
    /// Ran to the end but some tool failed, timed out or degraded.
    Partial,
    Skipped,
    Aborted,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PhaseStatus::NotStarted | PhaseStatus::Running)
    }
}

/// Run-wide state owned by the coordinator. Read-only once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub target: String,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub phases: BTreeMap<Phase, PhaseStatus>,
    pub issues: Vec<Issue>,
    pub waf: WafVerdict,
    pub missing_tools: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks_started: usize,
    pub tasks_completed: usize,
    #[serde(skip)]
    finalized: bool,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            target: target.into(),
            status: RunStatus::Running,
            current_phase: None,
            phases: Phase::ALL
                .into_iter()
                .map(|phase| (phase, PhaseStatus::NotStarted))
                .collect(),
            issues: Vec::new(),
            waf: WafVerdict::unknown(),
            missing_tools: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            tasks_started: 0,
            tasks_completed: 0,
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn on_event(&mut self, ev: &Event) {
        if self.finalized {
            return;
        }
        match ev {
            Event::PhaseStarted { phase, planned } => {
                tracing::info!(phase = %phase, "Phase started with {} work units", planned);
                self.current_phase = Some(*phase);
                self.phases.insert(*phase, PhaseStatus::Running);
            }
            Event::ToolStarted { tool, unit, .. } => {
                tracing::debug!(tool = %tool, unit = %unit, "Tool started");
                self.tasks_started += 1;
            }
            Event::ToolFinished {
                tool,
                unit,
                outcome,
                findings,
                ..
            } => {
                if *outcome != RunOutcome::Skipped {
                    self.tasks_completed += 1;
                }
                tracing::debug!(tool = %tool, unit = %unit, "Tool finished: {:?} ({} findings)", outcome, findings);
            }
            Event::PhaseSkipped { phase, reason } => {
                tracing::info!(phase = %phase, "Phase skipped: {}", reason);
                self.phases.insert(*phase, PhaseStatus::Skipped);
            }
            Event::PhaseFinished { phase, status, .. } => {
                self.phases.insert(*phase, *status);
            }
            Event::RunStarted { .. } | Event::PolicyChanged { .. } | Event::RunFinished { .. } => {}
        }
    }

    pub fn record_issue(&mut self, issue: Issue) {
        if self.finalized {
            return;
        }
        tracing::warn!(
            phase = ?issue.phase,
            tool = ?issue.tool,
            "{:?}: {}",
            issue.kind,
            issue.message
        );
        self.issues.push(issue);
    }

    pub fn set_phase_status(&mut self, phase: Phase, status: PhaseStatus) {
        if !self.finalized {
            self.phases.insert(phase, status);
        }
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phases
            .get(&phase)
            .copied()
            .unwrap_or(PhaseStatus::NotStarted)
    }

    /// Close the run. Phases still running become aborted.
    pub fn finalize(&mut self, aborted: bool) -> RunStatus {
        if self.finalized {
            return self.status;
        }
        for status in self.phases.values_mut() {
            if *status == PhaseStatus::Running {
                *status = PhaseStatus::Aborted;
            }
        }
        let any_degraded = self
            .phases
            .values()
            .any(|s| matches!(s, PhaseStatus::Partial | PhaseStatus::Aborted));

        self.status = if aborted {
            RunStatus::Aborted
        } else if any_degraded {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        self.finished_at = Some(Utc::now());
        self.current_phase = None;
        self.finalized = true;
        self.status
    }
}

/// Fully populated result handed to the report writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub target: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub waf: WafVerdict,
    pub policy_history: Vec<PolicyChange>,
    pub phases: Vec<PhaseResult>,
    pub issues: Vec<Issue>,
    pub missing_tools: Vec<String>,
}

impl RunReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases.iter().find(|result| result.phase == phase)
    }
}
