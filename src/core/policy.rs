//! Runtime scan policy and the controller that owns it.
//!
//! The controller is the only writer of the policy. Readers take a cheap
//! `Arc<Policy>` snapshot, so a tightened policy applies to every run that has
//! not been dispatched yet while in-flight runs keep the one they started with.

use super::models::Phase;
use super::scheduler::RunOutcome;
use crate::config::{DelayRange, EngineConfig};
use crate::config::types::AdaptiveConfig;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "de-DE,de;q=0.7,en;q=0.5", "pl-PL,pl;q=0.9,en;q=0.6"];

const ACCEPTS: &[&str] = &[
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordlistTier {
    Small,
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSet {
    /// Pick browser-like headers per invocation instead of the fixed agent.
    pub rotate: bool,
    pub user_agent: String,
}

impl HeaderSet {
    /// `Name: value` header lines for one tool invocation.
    pub fn for_invocation(&self) -> Vec<String> {
        if !self.rotate {
            return vec![format!("User-Agent: {}", self.user_agent)];
        }
        let mut rng = rand::thread_rng();
        let pick = |list: &[&str], rng: &mut rand::rngs::ThreadRng| {
            list.choose(rng).copied().unwrap_or_default().to_string()
        };
        let mut headers = vec![
            format!("User-Agent: {}", pick(BROWSER_USER_AGENTS, &mut rng)),
            format!("Accept: {}", pick(ACCEPTS, &mut rng)),
            format!("Accept-Language: {}", pick(ACCEPT_LANGUAGES, &mut rng)),
        ];
        if rng.gen_bool(0.5) {
            headers.push("DNT: 1".to_string());
        }
        headers
    }

    pub fn user_agent_for_invocation(&self) -> String {
        self.for_invocation()
            .first()
            .and_then(|line| line.strip_prefix("User-Agent: "))
            .unwrap_or(&self.user_agent)
            .to_string()
    }
}

/// A dominant response signature to filter out for one host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFilter {
    pub host: String,
    pub status: u16,
    pub length_min: u64,
    pub length_max: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub revision: u32,
    pub concurrency_limit: usize,
    pub delay_range_ms: DelayRange,
    pub headers: HeaderSet,
    pub wordlist_tier: WordlistTier,
    pub safe_mode: bool,
    /// Thread count passed to tools that take one.
    pub tool_threads: usize,
    pub tool_timeout_s: u64,
    pub response_filters: Vec<ResponseFilter>,
}

impl Policy {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_s)
    }

    pub fn filters_for(&self, host: &str) -> Vec<&ResponseFilter> {
        self.response_filters
            .iter()
            .filter(|filter| filter.host == host)
            .collect()
    }

    /// Random pause from the delay range; zero outside safe mode.
    pub fn jitter(&self) -> Duration {
        self.delay_range_ms.sample()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WafVerdict {
    pub detected: bool,
    pub vendor: Option<String>,
    /// `false` when no probe ran or the probe failed.
    pub probed: bool,
}

impl WafVerdict {
    pub fn unknown() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyChange {
    pub revision: u32,
    pub phase: Option<Phase>,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub policy: Policy,
}

#[derive(Debug)]
struct ControllerState {
    forced_safe: bool,
    escalated: bool,
    /// Observed verdict; never edited after the probe.
    waf: WafVerdict,
    /// The user relaxed the policy despite a detected WAF.
    waf_waived: bool,
    phase: Option<Phase>,
    finished: usize,
    errors: usize,
    filters: Vec<ResponseFilter>,
    revision: u32,
    history: Vec<PolicyChange>,
}

impl ControllerState {
    fn is_safe(&self) -> bool {
        self.forced_safe || self.escalated || (self.waf.detected && !self.waf_waived)
    }
}

/// Produces the active [`Policy`] from WAF, error-rate and response signals.
///
/// Tightening is a one-way ratchet within a run; only [`relax`](Self::relax)
/// loosens it.
pub struct AdaptiveController {
    settings: AdaptiveConfig,
    baseline_concurrency: usize,
    baseline_timeout_s: u64,
    user_agent: String,
    current: RwLock<Arc<Policy>>,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(config: &EngineConfig) -> Self {
        let mut state = ControllerState {
            forced_safe: config.safe_mode,
            escalated: false,
            waf: WafVerdict::unknown(),
            waf_waived: false,
            phase: None,
            finished: 0,
            errors: 0,
            filters: Vec::new(),
            revision: 0,
            history: Vec::new(),
        };
        let controller_settings = config.adaptive.clone();
        let baseline_concurrency = config.threads.max(1);
        let baseline_timeout_s = config.tool_timeout.as_secs().max(1);
        let user_agent = config.scan.user_agent.clone();

        let initial = Self::compute(
            &controller_settings,
            baseline_concurrency,
            baseline_timeout_s,
            &user_agent,
            &state,
        );
        state.history.push(PolicyChange {
            revision: initial.revision,
            phase: None,
            reason: if config.safe_mode {
                "initial (safe mode requested)".to_string()
            } else {
                "initial".to_string()
            },
            at: Utc::now(),
            policy: initial.clone(),
        });

        Self {
            settings: controller_settings,
            baseline_concurrency,
            baseline_timeout_s,
            user_agent,
            current: RwLock::new(Arc::new(initial)),
            state: Mutex::new(state),
        }
    }

    fn compute(
        settings: &AdaptiveConfig,
        baseline_concurrency: usize,
        baseline_timeout_s: u64,
        user_agent: &str,
        state: &ControllerState,
    ) -> Policy {
        if state.is_safe() {
            Policy {
                revision: state.revision,
                concurrency_limit: baseline_concurrency.min(settings.safe_concurrency).max(1),
                delay_range_ms: settings.safe_delay_ms,
                headers: HeaderSet {
                    rotate: true,
                    user_agent: user_agent.to_string(),
                },
                wordlist_tier: WordlistTier::Small,
                safe_mode: true,
                tool_threads: 1,
                tool_timeout_s: baseline_timeout_s
                    .saturating_mul(u64::from(settings.safe_timeout_multiplier.max(1))),
                response_filters: state.filters.clone(),
            }
        } else {
            Policy {
                revision: state.revision,
                concurrency_limit: baseline_concurrency,
                delay_range_ms: DelayRange::ZERO,
                headers: HeaderSet {
                    rotate: false,
                    user_agent: user_agent.to_string(),
                },
                wordlist_tier: WordlistTier::Full,
                safe_mode: false,
                tool_threads: baseline_concurrency,
                tool_timeout_s: baseline_timeout_s,
                response_filters: state.filters.clone(),
            }
        }
    }

    /// Recompute, bump the revision, publish and record. Caller holds the state lock.
    fn publish(&self, state: &mut ControllerState, reason: String) -> Arc<Policy> {
        state.revision += 1;
        let policy = Arc::new(Self::compute(
            &self.settings,
            self.baseline_concurrency,
            self.baseline_timeout_s,
            &self.user_agent,
            state,
        ));
        *self.current.write() = Arc::clone(&policy);
        state.history.push(PolicyChange {
            revision: policy.revision,
            phase: state.phase,
            reason: reason.clone(),
            at: Utc::now(),
            policy: (*policy).clone(),
        });
        tracing::info!(
            revision = policy.revision,
            safe_mode = policy.safe_mode,
            concurrency = policy.concurrency_limit,
            "Policy updated: {}",
            reason
        );
        policy
    }

    pub fn current(&self) -> Arc<Policy> {
        Arc::clone(&self.current.read())
    }

    /// Policy the controller would start a phase with given its current
    /// signals, without publishing it.
    pub fn initial_policy(&self) -> Policy {
        let state = self.state.lock();
        Self::compute(
            &self.settings,
            self.baseline_concurrency,
            self.baseline_timeout_s,
            &self.user_agent,
            &state,
        )
    }

    /// Non-safe policy for comparison with the active one.
    pub fn baseline_policy(&self) -> Policy {
        let state = self.state.lock();
        let baseline = ControllerState {
            forced_safe: false,
            escalated: false,
            waf: WafVerdict::unknown(),
            waf_waived: false,
            phase: state.phase,
            finished: 0,
            errors: 0,
            filters: state.filters.clone(),
            revision: state.revision,
            history: Vec::new(),
        };
        Self::compute(
            &self.settings,
            self.baseline_concurrency,
            self.baseline_timeout_s,
            &self.user_agent,
            &baseline,
        )
    }

    /// Phase boundary: reset the error window and publish the phase's policy.
    pub fn begin_phase(&self, phase: Phase) -> Arc<Policy> {
        let mut state = self.state.lock();
        state.phase = Some(phase);
        state.finished = 0;
        state.errors = 0;
        self.publish(&mut state, format!("{} started", phase))
    }

    pub fn apply_waf_verdict(&self, verdict: WafVerdict) -> Arc<Policy> {
        let mut state = self.state.lock();
        let was_safe = state.is_safe();
        state.waf = verdict.clone();
        if verdict.detected && !was_safe {
            let vendor = verdict.vendor.as_deref().unwrap_or("unknown vendor");
            tracing::warn!("WAF detected ({}), switching to safe mode", vendor);
            return self.publish(&mut state, format!("WAF detected: {}", vendor));
        }
        Arc::clone(&self.current.read())
    }

    pub fn waf(&self) -> WafVerdict {
        self.state.lock().waf.clone()
    }

    /// Feed one terminal ToolRun outcome into the phase's error window.
    /// Returns `true` if this outcome escalated the policy.
    pub fn record_outcome(&self, outcome: RunOutcome) -> bool {
        let mut state = self.state.lock();
        match outcome {
            RunOutcome::Succeeded => state.finished += 1,
            RunOutcome::Failed | RunOutcome::TimedOut => {
                state.finished += 1;
                state.errors += 1;
            }
            _ => return false,
        }

        if state.is_safe() || state.finished < self.settings.min_samples {
            return false;
        }
        let ratio = state.errors as f64 / state.finished as f64;
        if ratio >= self.settings.error_ratio_high_water {
            state.escalated = true;
            tracing::warn!(
                "Error ratio {:.2} over {} runs reached the high-water mark, tightening policy",
                ratio,
                state.finished
            );
            let reason = format!(
                "error ratio {}/{} reached {:.2}",
                state.errors, state.finished, self.settings.error_ratio_high_water
            );
            self.publish(&mut state, reason);
            return true;
        }
        false
    }

    /// A wildcard signature was found. Blocking statuses escalate immediately;
    /// every signature is published as a response filter for runs not yet
    /// started.
    /// A signature whose length window moved replaces the earlier filter for
    /// the same host and status.
    pub fn record_wildcard(&self, filter: ResponseFilter) {
        let mut state = self.state.lock();
        if state.filters.contains(&filter) {
            return;
        }
        state
            .filters
            .retain(|old| !(old.host == filter.host && old.status == filter.status));
        let blocking = self.settings.block_statuses.contains(&filter.status);
        let reason = if blocking {
            format!(
                "blocking responses ({}) dominate {}",
                filter.status, filter.host
            )
        } else {
            format!(
                "wildcard responses ({} / {}-{} bytes) on {}",
                filter.status, filter.length_min, filter.length_max, filter.host
            )
        };
        state.filters.push(filter);
        if blocking {
            state.escalated = true;
        }
        self.publish(&mut state, reason);
    }

    /// Mid-run evidence that the target started blocking us, such as a
    /// changed root page. Returns the tightened policy, or `None` when safe
    /// mode was already active.
    pub fn record_block_signal(&self, reason: &str) -> Option<Arc<Policy>> {
        let mut state = self.state.lock();
        if state.is_safe() {
            tracing::debug!("Block signal while already in safe mode: {}", reason);
            return None;
        }
        state.escalated = true;
        tracing::warn!("Target appears to be blocking: {}, switching to safe mode", reason);
        Some(self.publish(&mut state, format!("block detected: {}", reason)))
    }

    /// Explicit user action; the only path that loosens the policy. The WAF
    /// verdict itself is kept for the report.
    pub fn relax(&self, reason: &str) -> Arc<Policy> {
        let mut state = self.state.lock();
        state.forced_safe = false;
        state.escalated = false;
        state.waf_waived = state.waf.detected;
        state.finished = 0;
        state.errors = 0;
        self.publish(&mut state, format!("relaxed by user: {}", reason))
    }

    pub fn history(&self) -> Vec<PolicyChange> {
        self.state.lock().history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;

    fn controller(safe_mode: bool) -> AdaptiveController {
        let mut config = EngineConfig::new(GlobalConfig::default(), "out");
        config.safe_mode = safe_mode;
        AdaptiveController::new(&config)
    }

    #[test]
    fn baseline_is_unthrottled() {
        let c = controller(false);
        let policy = c.begin_phase(Phase::Subdomains);
        assert!(!policy.safe_mode);
        assert_eq!(policy.concurrency_limit, 8);
        assert!(policy.delay_range_ms.is_zero());
        assert_eq!(policy.wordlist_tier, WordlistTier::Full);
        assert_eq!(policy.jitter(), Duration::ZERO);
    }

    #[test]
    fn forced_safe_mode_holds_for_every_phase() {
        let c = controller(true);
        for phase in Phase::ALL {
            let policy = c.begin_phase(phase);
            let baseline = c.baseline_policy();
            assert!(policy.safe_mode);
            assert!(policy.concurrency_limit <= baseline.concurrency_limit);
            assert!(!policy.delay_range_ms.is_zero());
            assert!(policy.headers.rotate);
            assert_eq!(policy.wordlist_tier, WordlistTier::Small);
            assert_eq!(policy.tool_threads, 1);
        }
    }

    #[test]
    fn waf_detection_escalates_once() {
        let c = controller(false);
        let policy = c.apply_waf_verdict(WafVerdict {
            detected: true,
            vendor: Some("Cloudflare".into()),
            probed: true,
        });
        assert!(policy.safe_mode);
        let revisions = c.history().len();
        c.apply_waf_verdict(WafVerdict {
            detected: true,
            vendor: Some("Cloudflare".into()),
            probed: true,
        });
        assert_eq!(c.history().len(), revisions);
    }

    #[test]
    fn error_ratio_ratchets_and_never_loosens() {
        let c = controller(false);
        c.begin_phase(Phase::Directories);
        assert!(!c.record_outcome(RunOutcome::Failed));
        assert!(!c.record_outcome(RunOutcome::TimedOut));
        assert!(!c.record_outcome(RunOutcome::Succeeded));
        // 3/4 errors reaches the 0.5 high-water mark once min_samples is met
        assert!(c.record_outcome(RunOutcome::Failed));
        assert!(c.current().safe_mode);

        for _ in 0..20 {
            c.record_outcome(RunOutcome::Succeeded);
        }
        assert!(c.current().safe_mode);
        // a new phase keeps the ratchet
        assert!(c.begin_phase(Phase::Crawling).safe_mode);

        let relaxed = c.relax("operator confirmed target is healthy");
        assert!(!relaxed.safe_mode);
    }

    #[test]
    fn skipped_and_cancelled_runs_do_not_count() {
        let c = controller(false);
        c.begin_phase(Phase::Ports);
        for _ in 0..10 {
            assert!(!c.record_outcome(RunOutcome::Skipped));
            assert!(!c.record_outcome(RunOutcome::Cancelled));
        }
        assert!(!c.current().safe_mode);
    }

    #[test]
    fn blocking_wildcard_escalates_and_publishes_filter() {
        let c = controller(false);
        c.begin_phase(Phase::Directories);
        c.record_wildcard(ResponseFilter {
            host: "example.com".into(),
            status: 403,
            length_min: 200,
            length_max: 210,
        });
        let policy = c.current();
        assert!(policy.safe_mode);
        assert_eq!(policy.filters_for("example.com").len(), 1);
        assert_eq!(policy.filters_for("other.com").len(), 0);
    }

    #[test]
    fn plain_wildcard_only_adds_filter() {
        let c = controller(false);
        c.record_wildcard(ResponseFilter {
            host: "example.com".into(),
            status: 200,
            length_min: 1423,
            length_max: 1423,
        });
        let policy = c.current();
        assert!(!policy.safe_mode);
        assert_eq!(policy.response_filters.len(), 1);
    }

    #[test]
    fn relax_keeps_the_observed_waf_verdict() {
        let c = controller(false);
        c.apply_waf_verdict(WafVerdict {
            detected: true,
            vendor: Some("Cloudflare".into()),
            probed: true,
        });
        assert!(c.current().safe_mode);

        let relaxed = c.relax("operator confirmed");
        assert!(!relaxed.safe_mode);
        assert!(!c.begin_phase(Phase::Osint).safe_mode);
        assert_eq!(
            c.waf(),
            WafVerdict {
                detected: true,
                vendor: Some("Cloudflare".into()),
                probed: true,
            }
        );
    }

    #[test]
    fn block_signal_escalates_once_even_after_relax() {
        let c = controller(false);
        c.begin_phase(Phase::Directories);
        let policy = c.record_block_signal("root page status 200 -> 403").unwrap();
        assert!(policy.safe_mode);
        assert!(c.record_block_signal("root page status 200 -> 429").is_none());
        assert!(c.history().last().unwrap().reason.contains("200 -> 403"));

        c.relax("operator confirmed");
        assert!(c.record_block_signal("root page body changed").is_some());
        assert!(c.current().safe_mode);
    }

    #[test]
    fn moved_wildcard_window_replaces_the_filter() {
        let c = controller(false);
        let filter = |length_max| ResponseFilter {
            host: "example.com".into(),
            status: 200,
            length_min: 1423,
            length_max,
        };
        c.record_wildcard(filter(1423));
        c.record_wildcard(filter(1430));
        let policy = c.current();
        assert_eq!(policy.filters_for("example.com"), vec![&filter(1430)]);
    }

    #[test]
    fn revisions_increase_monotonically() {
        let c = controller(false);
        c.begin_phase(Phase::Osint);
        c.begin_phase(Phase::Subdomains);
        let history = c.history();
        assert!(history.windows(2).all(|w| w[0].revision < w[1].revision));
        assert_eq!(history[0].reason, "initial");
    }

    #[test]
    fn rotating_headers_look_like_a_browser() {
        let headers = HeaderSet {
            rotate: true,
            user_agent: "fixed".into(),
        };
        let lines = headers.for_invocation();
        assert!(lines[0].starts_with("User-Agent: Mozilla/5.0"));
        assert!(lines.iter().any(|l| l.starts_with("Accept-Language: ")));
        assert!(headers.user_agent_for_invocation().starts_with("Mozilla/5.0"));
    }
}
