//! Phase 1 discovery: passive enumerators and DNS brute force.
//!
//! All four tools print one host per line. Lines outside the target domain
//! are read but dropped.

use super::types::{
    CommandSpec, ParseOutcome, PhaseInput, RawOutput, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Finding, normalize_host};
use crate::core::models::Phase;
use crate::core::policy::{Policy, WordlistTier};
use crate::core::scope::in_domain;
use std::net::IpAddr;

fn is_domain_input(input: &str) -> bool {
    input.parse::<IpAddr>().is_err()
}

/// Shared parser: one host per line, scoped to the unit's domain.
fn parse_hosts(stdout: &str, domain: &str, source: &str) -> ParseOutcome {
    let domain = domain.to_ascii_lowercase();
    parse_lines(stdout, |line| {
        let candidate = line.split_whitespace().next()?;
        if !candidate.contains('.') {
            return None;
        }
        let host = normalize_host(candidate)?;
        if !in_domain(&host, &domain) {
            tracing::debug!("{}: dropping out-of-scope host {}", source, host);
            return Some(Vec::new());
        }
        Some(Finding::subdomain(&host, source).into_iter().collect())
    })
}

macro_rules! passive_enumerator {
    ($ty:ident, $name:literal, $cost:literal, |$ctx:ident, $domain:ident| $args:expr) => {
        pub struct $ty;

        impl ToolAdapter for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn binary(&self) -> &'static str {
                $name
            }

            fn phase(&self) -> Phase {
                Phase::Subdomains
            }

            fn cost_hint(&self) -> u32 {
                $cost
            }

            fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
                is_domain_input(input)
            }

            fn build_invocation(
                &self,
                $ctx: &ToolContext,
                policy: &Policy,
            ) -> Result<CommandSpec, EngineError> {
                let $domain = $ctx.unit.input();
                Ok($ctx.command(policy).args($args))
            }

            fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
                parse_hosts(&raw.stdout, ctx.unit.input(), self.name())
            }
        }
    };
}

passive_enumerator!(Subfinder, "subfinder", 10, |ctx, domain| ["-d", domain, "-silent"]);
passive_enumerator!(Assetfinder, "assetfinder", 10, |ctx, domain| ["--subs-only", domain]);
passive_enumerator!(Findomain, "findomain", 15, |ctx, domain| ["--target", domain, "-q"]);

pub struct Puredns;

impl ToolAdapter for Puredns {
    fn name(&self) -> &'static str {
        "puredns"
    }

    fn binary(&self) -> &'static str {
        "puredns"
    }

    fn phase(&self) -> Phase {
        Phase::Subdomains
    }

    fn cost_hint(&self) -> u32 {
        60
    }

    fn accepts(&self, input: &str, _phase_input: &PhaseInput) -> bool {
        is_domain_input(input)
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let wordlists = &ctx.config.wordlists;
        let wordlist = match policy.wordlist_tier {
            WordlistTier::Full => &wordlists.subdomains,
            WordlistTier::Small => &wordlists.subdomains_small,
        };
        let rate = if policy.safe_mode {
            ctx.config.scan.safe_puredns_rate
        } else {
            ctx.config.scan.puredns_rate
        };
        Ok(ctx
            .command(policy)
            .arg("bruteforce")
            .arg(wordlist.display().to_string())
            .arg(ctx.unit.input())
            .opt("--resolvers", wordlists.resolvers.display().to_string())
            .opt("--rate-limit", rate.to_string())
            .arg("-q"))
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        parse_hosts(&raw.stdout, ctx.unit.input(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::testing::{context, policy};
    use pretty_assertions::assert_eq;

    fn hosts(outcome: &ParseOutcome) -> Vec<String> {
        outcome
            .findings
            .iter()
            .filter_map(|f| f.host().map(str::to_string))
            .collect()
    }

    #[test]
    fn subfinder_output_is_scoped() {
        let ctx = context("example.com", &["example.com"]);
        let stdout = "api.example.com\nWWW.Example.com\n\nexample.com.evil.net\nexample.com\n";
        let outcome = Subfinder.parse(&RawOutput::from_stdout(stdout), &ctx);
        assert_eq!(
            hosts(&outcome),
            vec!["api.example.com", "www.example.com", "example.com"]
        );
        assert!(!outcome.degraded);
    }

    #[test]
    fn banner_only_output_is_degraded() {
        let ctx = context("example.com", &["example.com"]);
        let outcome = Findomain.parse(&RawOutput::from_stdout("Searching in the Crtsh API\n"), &ctx);
        assert!(outcome.findings.is_empty());
        assert!(outcome.degraded);

        let outcome = Findomain.parse(
            &RawOutput::from_stdout("Searching in the Crtsh API\nmail.example.com\n"),
            &ctx,
        );
        assert_eq!(outcome.findings.len(), 1);
        assert!(!outcome.degraded);
    }

    #[test]
    fn ip_inputs_are_refused() {
        let input = PhaseInput::default();
        assert!(!Subfinder.accepts("10.0.0.1", &input));
        assert!(Assetfinder.accepts("example.com", &input));
    }

    #[test]
    fn puredns_follows_policy() {
        let ctx = context("example.com", &["example.com"]);
        let normal = Puredns.build_invocation(&ctx, &policy(false)).unwrap();
        let safe = Puredns.build_invocation(&ctx, &policy(true)).unwrap();

        assert_eq!(normal.args[0], "bruteforce");
        assert!(normal.args.contains(&"1000".to_string()));
        assert!(safe.args.contains(&"50".to_string()));
        assert!(safe.args[1].contains("5000"));
    }

    #[test]
    fn enumerator_args() {
        let ctx = context("example.com", &["example.com"]);
        let spec = Findomain.build_invocation(&ctx, &policy(false)).unwrap();
        assert_eq!(spec.args, vec!["--target", "example.com", "-q"]);
    }
}
