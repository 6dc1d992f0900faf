//! Live progress on stderr, driven by engine events.

use crate::core::events::{self, Event, EventReceiver, EventSender};
use crate::core::scheduler::RunOutcome;
use crate::core::state::PhaseStatus;
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;
use tokio::task::JoinHandle;

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(TICKS)
}

fn status_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub struct ProgressManager {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    status_bar: ProgressBar,
    running: usize,
    finished: usize,
    findings: usize,
    quiet: bool,
}

impl ProgressManager {
    pub fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let phase_bar = multi.add(ProgressBar::new_spinner());
        phase_bar.set_style(spinner_style());
        phase_bar.enable_steady_tick(Duration::from_millis(100));
        phase_bar.set_message("starting");

        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style());

        Self {
            multi,
            phase_bar,
            status_bar,
            running: 0,
            finished: 0,
            findings: 0,
            quiet,
        }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            let _ = self.multi.println(text);
        }
    }

    fn refresh_status(&self) {
        self.status_bar.set_message(format!(
            "{} running • {} finished • {} findings",
            self.running, self.finished, self.findings
        ));
    }

    /// Apply one event. Returns `false` once the run has finished.
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::RunStarted { run_id, target } => {
                self.line(format!("{} {} ({})", "▶".cyan().bold(), target.bold(), run_id.dimmed()));
            }
            Event::PhaseStarted { phase, planned } => {
                self.running = 0;
                self.phase_bar
                    .set_message(format!("{} • {} inputs", phase.to_string().bold(), planned));
                self.refresh_status();
            }
            Event::PhaseSkipped { phase, reason } => {
                self.line(format!("{} {} skipped: {}", "○".yellow(), phase, reason.dimmed()));
            }
            Event::ToolStarted { tool, unit, .. } => {
                self.running += 1;
                self.phase_bar.set_message(format!("{} {}", tool.cyan(), unit.dimmed()));
                self.refresh_status();
            }
            Event::ToolFinished {
                tool,
                unit,
                outcome,
                findings,
                ..
            } => {
                if outcome != RunOutcome::Skipped && outcome != RunOutcome::Cancelled {
                    self.running = self.running.saturating_sub(1);
                }
                self.finished += 1;
                self.findings += findings;
                let mark = match outcome {
                    RunOutcome::Succeeded => "✓".green(),
                    RunOutcome::Failed => "✗".red(),
                    RunOutcome::TimedOut => "⏱".red(),
                    RunOutcome::Skipped => "-".dimmed(),
                    RunOutcome::Cancelled => "■".yellow(),
                    RunOutcome::Pending | RunOutcome::Running => "?".normal(),
                };
                if outcome != RunOutcome::Skipped {
                    self.line(format!("  {} {} {} ({} findings)", mark, tool, unit.dimmed(), findings));
                }
                self.refresh_status();
            }
            Event::PolicyChanged {
                revision,
                reason,
                safe_mode,
                concurrency,
            } => {
                let mode = if safe_mode { "safe".yellow() } else { "normal".green() };
                self.line(format!(
                    "{} policy r{}: {} ({} mode, concurrency {})",
                    "⚑".yellow(),
                    revision,
                    reason,
                    mode,
                    concurrency
                ));
            }
            Event::PhaseFinished {
                phase,
                status,
                findings,
            } => {
                let status_text = match status {
                    PhaseStatus::Completed => "completed".green(),
                    PhaseStatus::Partial => "partial".yellow(),
                    PhaseStatus::Aborted => "aborted".red(),
                    PhaseStatus::Skipped => "skipped".yellow(),
                    PhaseStatus::NotStarted | PhaseStatus::Running => "running".normal(),
                };
                self.line(format!("{} {} {} • {} findings", "●".blue(), phase, status_text, findings));
            }
            Event::RunFinished { .. } => {
                self.finish();
                return false;
            }
        }
        true
    }

    pub fn finish(&self) {
        self.phase_bar.finish_and_clear();
        self.status_bar.finish_and_clear();
    }
}

/// Spawn the consumer; the returned sender goes to the coordinator.
pub fn start_progress_task(quiet: bool) -> (EventSender, JoinHandle<()>) {
    let (tx, rx) = events::channel();
    let handle = tokio::spawn(consume(rx, quiet));
    (tx, handle)
}

async fn consume(mut rx: EventReceiver, quiet: bool) {
    let mut manager = ProgressManager::new(quiet);
    while let Some(event) = rx.recv().await {
        if !manager.handle(event) {
            return;
        }
    }
    manager.finish();
}
