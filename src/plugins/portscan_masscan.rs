use super::types::{
    CommandSpec, ParseOutcome, PhaseInput, RawOutput, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Finding, Protocol};
use crate::core::models::Phase;
use crate::core::policy::Policy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

static DISCOVERED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Discovered open port (\d+)/(tcp|udp) on (\S+)").expect("masscan regex")
});

/// masscan only takes addresses; hostnames go through the resolved map.
#[derive(Clone)]
pub struct MasscanPortScan;

impl MasscanPortScan {
    fn address_of(host: &str, input: &PhaseInput) -> Option<IpAddr> {
        host.parse::<IpAddr>()
            .ok()
            .or_else(|| input.resolved.get(host).and_then(|addrs| addrs.first().copied()))
    }
}

impl ToolAdapter for MasscanPortScan {
    fn name(&self) -> &'static str {
        "masscan"
    }

    fn binary(&self) -> &'static str {
        "masscan"
    }

    fn phase(&self) -> Phase {
        Phase::Ports
    }

    fn cost_hint(&self) -> u32 {
        40
    }

    fn accepts(&self, input: &str, phase_input: &PhaseInput) -> bool {
        Self::address_of(input, phase_input).is_some()
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let host = ctx.unit.input();
        let address = Self::address_of(host, &ctx.input).ok_or_else(|| {
            EngineError::ConfigInvalid(format!("masscan needs an address for {host}"))
        })?;
        let scan = &ctx.config.scan;
        let rate = if policy.safe_mode {
            scan.safe_masscan_rate
        } else {
            scan.masscan_rate
        };
        let ports = scan.port_range().unwrap_or_else(|| "1-65535".to_string());
        let mut spec = ctx
            .command(policy)
            .arg(address.to_string())
            .arg(format!("-p{ports}"))
            .opt("--rate", rate.to_string());
        if !scan.excluded_ports.is_empty() {
            let excluded: Vec<String> = scan.excluded_ports.iter().map(u16::to_string).collect();
            spec = spec.opt("--exclude-ports", excluded.join(","));
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let host = ctx.unit.input();
        let excluded = &ctx.config.scan.excluded_ports;
        parse_lines(&raw.stdout, |line| {
            let caps = DISCOVERED_RE.captures(line)?;
            let port: u16 = caps[1].parse().ok()?;
            let protocol = if &caps[2] == "udp" {
                Protocol::Udp
            } else {
                Protocol::Tcp
            };
            if excluded.contains(&port) {
                return Some(Vec::new());
            }
            // findings are keyed by the scanned host name, not the address
            Some(Finding::port(host, port, protocol, self.name()).into_iter().collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::testing::{context, policy};
    use std::sync::Arc;

    #[test]
    fn parses_discovered_lines() {
        let ctx = context("example.com", &["app.example.com"]);
        let stdout = "Starting masscan 1.3.2\nDiscovered open port 443/tcp on 93.184.216.34\nDiscovered open port 53/udp on 93.184.216.34\nrate: 0.00-kpps\n";
        let outcome = MasscanPortScan.parse(&RawOutput::from_stdout(stdout), &ctx);
        let found: Vec<(String, u16, Protocol)> = outcome
            .findings
            .iter()
            .map(|f| match f {
                Finding::Port(p) => (p.host.clone(), p.port, p.protocol),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("app.example.com".to_string(), 443, Protocol::Tcp),
                ("app.example.com".to_string(), 53, Protocol::Udp),
            ]
        );
        assert_eq!(outcome.skipped_lines, 2);
    }

    #[test]
    fn needs_an_address() {
        let mut input = PhaseInput::new(vec!["app.example.com".into()]);
        assert!(!MasscanPortScan.accepts("app.example.com", &input));
        assert!(MasscanPortScan.accepts("10.0.0.7", &input));

        input
            .resolved
            .insert("app.example.com".into(), vec!["93.184.216.34".parse().unwrap()]);
        assert!(MasscanPortScan.accepts("app.example.com", &input));

        let mut ctx = context("example.com", &["app.example.com"]);
        ctx.input = Arc::new(input);
        let spec = MasscanPortScan.build_invocation(&ctx, &policy(false)).unwrap();
        assert_eq!(spec.args[0], "93.184.216.34");
        assert_eq!(spec.args[1], "-p1-65535");
        assert!(spec.has_arg("300"));
    }
}
