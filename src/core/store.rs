//! Aggregation store: the per-phase deduplicated finding sets for one run.
//!
//! Writes go through [`AggregationStore::commit`], called only from the
//! scheduler's collection loop, so a ToolRun's findings become visible in a
//! single step once the run is terminal.

use super::findings::{Finding, IdentityKey};
use super::models::Phase;
use super::normalizer::{MergeStats, Normalizer, WildcardSignature};
use super::scheduler::{RunOutcome, ToolRun};
use super::state::PhaseStatus;
use crate::config::types::WildcardConfig;
use crate::utils::fs::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

fn findings_as_list<S: Serializer>(
    findings: &BTreeMap<IdentityKey, Finding>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(findings.values())
}

fn findings_from_list<'de, D>(deserializer: D) -> Result<BTreeMap<IdentityKey, Finding>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let list = Vec::<Finding>::deserialize(deserializer)?;
    Ok(list.into_iter().map(|f| (f.identity_key(), f)).collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub skipped: bool,
    #[serde(serialize_with = "findings_as_list", deserialize_with = "findings_from_list")]
    pub findings: BTreeMap<IdentityKey, Finding>,
    pub runs: Vec<ToolRun>,
    pub tools_run: BTreeSet<String>,
    pub tools_failed: BTreeSet<String>,
    pub tools_skipped: BTreeSet<String>,
    /// Tools with at least one run that never reached a terminal outcome
    /// before an abort.
    pub incomplete_tools: BTreeSet<String>,
    pub wildcard_signatures: Vec<WildcardSignature>,
    pub input_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u128,
}

impl PhaseResult {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::NotStarted,
            skipped: false,
            findings: BTreeMap::new(),
            runs: Vec::new(),
            tools_run: BTreeSet::new(),
            tools_failed: BTreeSet::new(),
            tools_skipped: BTreeSet::new(),
            incomplete_tools: BTreeSet::new(),
            wildcard_signatures: Vec::new(),
            input_count: 0,
            started_at: None,
            duration_ms: 0,
        }
    }

    /// Default view: everything except findings flagged as wildcard responses.
    pub fn visible_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.values().filter(|f| !f.is_likely_wildcard())
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Finding> {
        self.findings.get(key)
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// `true` if any run of `tool` in the given outcome.
    pub fn tool_reached(&self, tool: &str, outcome: RunOutcome) -> bool {
        self.runs
            .iter()
            .any(|run| run.tool == tool && run.state == outcome)
    }
}

#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub merged: MergeStats,
    /// Signatures not present before this commit.
    pub new_signatures: Vec<WildcardSignature>,
}

pub struct AggregationStore {
    phases: RwLock<BTreeMap<Phase, PhaseResult>>,
    normalizer: Normalizer,
}

impl AggregationStore {
    pub fn new(wildcard: WildcardConfig) -> Self {
        Self {
            phases: RwLock::new(BTreeMap::new()),
            normalizer: Normalizer::new(wildcard),
        }
    }

    /// Start (or restart) a phase with an empty result set.
    pub fn open_phase(&self, phase: Phase, input_count: usize) {
        let mut result = PhaseResult::new(phase);
        result.status = PhaseStatus::Running;
        result.input_count = input_count;
        result.started_at = Some(Utc::now());
        self.phases.write().insert(phase, result);
    }

    pub fn commit(&self, phase: Phase, run: ToolRun, findings: Vec<Finding>) -> CommitOutcome {
        let mut phases = self.phases.write();
        let result = phases
            .entry(phase)
            .or_insert_with(|| PhaseResult::new(phase));

        match run.state {
            RunOutcome::Succeeded => {
                result.tools_run.insert(run.tool.clone());
            }
            RunOutcome::Failed | RunOutcome::TimedOut => {
                result.tools_run.insert(run.tool.clone());
                result.tools_failed.insert(run.tool.clone());
            }
            RunOutcome::Skipped => {
                result.tools_skipped.insert(run.tool.clone());
            }
            RunOutcome::Cancelled | RunOutcome::Pending | RunOutcome::Running => {
                result.incomplete_tools.insert(run.tool.clone());
            }
        }
        result.runs.push(run);

        let merged = self.normalizer.merge_into(&mut result.findings, findings);

        let mut new_signatures = Vec::new();
        if phase == Phase::Directories && merged != MergeStats::default() {
            let signatures = self.normalizer.suppress_wildcards(&mut result.findings);
            new_signatures = signatures
                .iter()
                .filter(|sig| {
                    !result.wildcard_signatures.iter().any(|old| {
                        old.host == sig.host
                            && old.status == sig.status
                            && old.length_min == sig.length_min
                            && old.length_max == sig.length_max
                    })
                })
                .cloned()
                .collect();
            result.wildcard_signatures = signatures;
        }

        CommitOutcome {
            merged,
            new_signatures,
        }
    }

    pub fn close_phase(&self, phase: Phase, status: PhaseStatus, duration: Duration) {
        let mut phases = self.phases.write();
        let result = phases
            .entry(phase)
            .or_insert_with(|| PhaseResult::new(phase));
        result.status = status;
        result.skipped = status == PhaseStatus::Skipped;
        result.duration_ms = duration.as_millis();
    }

    /// Record a phase that never ran: empty finding set, `skipped = true`.
    pub fn mark_skipped(&self, phase: Phase) {
        let mut result = PhaseResult::new(phase);
        result.status = PhaseStatus::Skipped;
        result.skipped = true;
        self.phases.write().insert(phase, result);
    }

    pub fn phase(&self, phase: Phase) -> Option<PhaseResult> {
        self.phases.read().get(&phase).cloned()
    }

    pub fn snapshot(&self) -> Vec<PhaseResult> {
        self.phases.read().values().cloned().collect()
    }

    /// Optional persistence of the current store contents.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .context("Failed to serialise aggregation store")?;
        atomic_write(path, &json)
            .with_context(|| format!("Failed to persist store to {}", path.display()))
    }
}
