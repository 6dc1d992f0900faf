use super::models::Phase;
use super::scheduler::RunOutcome;
use super::state::{PhaseStatus, RunStatus};
use tokio::sync::mpsc;

/// Progress notifications for presentation layers. The engine never waits on
/// a consumer; a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub enum Event {
    RunStarted {
        run_id: String,
        target: String,
    },
    PhaseStarted {
        phase: Phase,
        planned: usize,
    },
    PhaseSkipped {
        phase: Phase,
        reason: String,
    },
    ToolStarted {
        phase: Phase,
        tool: String,
        unit: String,
    },
    ToolFinished {
        phase: Phase,
        tool: String,
        unit: String,
        outcome: RunOutcome,
        findings: usize,
    },
    PolicyChanged {
        revision: u32,
        reason: String,
        safe_mode: bool,
        concurrency: usize,
    },
    PhaseFinished {
        phase: Phase,
        status: PhaseStatus,
        findings: usize,
    },
    RunFinished {
        status: RunStatus,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
