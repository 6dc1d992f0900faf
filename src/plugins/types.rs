use crate::config::EngineConfig;
use crate::core::errors::EngineError;
use crate::core::findings::Finding;
use crate::core::models::{Phase, Target};
use crate::core::policy::Policy;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

pub use crate::executors::command::CommandSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Produces candidate findings.
    Discover,
    /// Re-checks merged candidates; its values carry `Verified` evidence.
    Verify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fanout {
    /// One work unit per input.
    PerTarget,
    /// One work unit for all inputs, passed through a list file.
    Batch,
}

/// Everything a phase hands to its adapters.
#[derive(Debug, Clone, Default)]
pub struct PhaseInput {
    /// Hosts or URLs, depending on the phase.
    pub items: Vec<String>,
    /// Open ports per host (phase 2 verify).
    pub ports: BTreeMap<String, BTreeSet<u16>>,
    /// Lowercased technology names from phase 0.
    pub technologies: BTreeSet<String>,
    pub resolved: BTreeMap<String, Vec<IpAddr>>,
}

impl PhaseInput {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Short, file-name-safe label (`example.com`, `batch`).
    pub label: String,
    pub inputs: Vec<String>,
    /// Batch units: file holding one input per line.
    pub list_file: Option<PathBuf>,
    /// Output sink the tool writes to, if the adapter declares one.
    pub output_file: Option<PathBuf>,
}

impl WorkUnit {
    /// The single input of a per-target unit.
    pub fn input(&self) -> &str {
        self.inputs.first().map(String::as_str).unwrap_or_default()
    }
}

pub struct ToolContext {
    pub target: Arc<Target>,
    pub config: Arc<EngineConfig>,
    pub input: Arc<PhaseInput>,
    pub unit: WorkUnit,
    /// Executable to invoke (config override or the adapter's binary).
    pub program: String,
    /// Phase raw-output directory, used as the working directory.
    pub cwd: PathBuf,
}

impl ToolContext {
    /// Base command with program, working directory and policy timeout.
    pub fn command(&self, policy: &Policy) -> CommandSpec {
        CommandSpec::new(&self.program, &self.cwd, policy.tool_timeout())
    }

    pub fn list_file(&self) -> Result<String, EngineError> {
        self.unit
            .list_file
            .as_ref()
            .map(|path| path.display().to_string())
            .ok_or_else(|| EngineError::ConfigInvalid(format!("unit {} has no list file", self.unit.label)))
    }

    pub fn output_file(&self) -> Result<String, EngineError> {
        self.unit
            .output_file
            .as_ref()
            .map(|path| path.display().to_string())
            .ok_or_else(|| EngineError::ConfigInvalid(format!("unit {} has no output sink", self.unit.label)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: String,
    /// Contents of the output sink, when the tool wrote one.
    pub sink: Option<String>,
}

impl RawOutput {
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            sink: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub findings: Vec<Finding>,
    /// Lines understood, whether or not they produced a finding.
    pub parsed_lines: usize,
    pub skipped_lines: usize,
    /// Output was present but nothing in it could be parsed.
    pub degraded: bool,
}

impl ParseOutcome {
    pub fn new(findings: Vec<Finding>, parsed_lines: usize, skipped_lines: usize) -> Self {
        Self {
            degraded: parsed_lines == 0 && skipped_lines > 0,
            findings,
            parsed_lines,
            skipped_lines,
        }
    }
}

/// Line-oriented parse: `f` returns `None` for lines it cannot read and
/// `Some(findings)` (possibly empty) for lines it understood.
pub fn parse_lines<F>(text: &str, mut f: F) -> ParseOutcome
where
    F: FnMut(&str) -> Option<Vec<Finding>>,
{
    let mut findings = Vec::new();
    let mut parsed = 0;
    let mut skipped = 0;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match f(line) {
            Some(found) => {
                parsed += 1;
                findings.extend(found);
            }
            None => skipped += 1,
        }
    }
    ParseOutcome::new(findings, parsed, skipped)
}

/// One external tool: how to invoke it and how to read what it prints.
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn binary(&self) -> &'static str;

    fn phase(&self) -> Phase;

    fn stage(&self) -> Stage {
        Stage::Discover
    }

    fn fanout(&self) -> Fanout {
        Fanout::PerTarget
    }

    /// Relative expected runtime; cheaper units are dispatched first.
    fn cost_hint(&self) -> u32;

    fn accepts(&self, _input: &str, _phase_input: &PhaseInput) -> bool {
        true
    }

    /// Inputs with the same key share one work unit.
    fn unit_key(&self, input: &str) -> String {
        input.to_string()
    }

    /// File extension of an output sink the tool writes, if any.
    fn output_sink(&self) -> Option<&'static str> {
        None
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError>;

    /// Tolerant parse: malformed lines are skipped, never fatal.
    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome;
}
