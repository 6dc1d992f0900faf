use super::models::Phase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecError {
    pub tool: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub duration_ms: u128,
}

impl ExecError {
    /// Last `lines` lines of stderr, enough to attribute a crash.
    pub fn tail(stderr: &str, lines: usize) -> String {
        let all: Vec<&str> = stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Failure taxonomy of the engine. Only `ConfigInvalid` (and I/O while
/// preparing the run directory) aborts a run; everything else is recorded
/// against the tool or phase that raised it.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("tool missing: {0} is not on PATH")]
    ToolMissing(String),

    #[error("tool timed out: {tool} after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("tool crashed: {} exited with {:?}", .0.tool, .0.exit_code)]
    ToolCrashed(ExecError),

    #[error("output of {tool} only partially parsed: {detail}")]
    ParseDegraded { tool: String, detail: String },

    #[error("no input for {0}")]
    PhaseInputEmpty(Phase),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> IssueKind {
        match self {
            EngineError::ToolMissing(_) => IssueKind::ToolMissing,
            EngineError::ToolTimeout { .. } => IssueKind::ToolTimeout,
            EngineError::ToolCrashed(_) => IssueKind::ToolCrashed,
            EngineError::ParseDegraded { .. } => IssueKind::ParseDegraded,
            EngineError::PhaseInputEmpty(_) => IssueKind::PhaseInputEmpty,
            EngineError::ConfigInvalid(_) => IssueKind::ConfigInvalid,
            EngineError::Cancelled => IssueKind::Cancelled,
            EngineError::Io(_) => IssueKind::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ToolMissing,
    ToolTimeout,
    ToolCrashed,
    ParseDegraded,
    PhaseInputEmpty,
    ConfigInvalid,
    Cancelled,
    Io,
}

/// A recovered error, attributed and kept for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub phase: Option<Phase>,
    pub tool: Option<String>,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase: None,
            tool: None,
            message: message.into(),
        }
    }

    pub fn from_error(err: &EngineError) -> Self {
        Self::new(err.kind(), err.to_string())
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn for_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}
