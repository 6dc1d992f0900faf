use super::types::{CommandSpec, ParseOutcome, RawOutput, ToolAdapter, ToolContext, parse_lines};
use crate::core::errors::EngineError;
use crate::core::findings::{Finding, Protocol};
use crate::core::models::Phase;
use crate::core::policy::Policy;
use serde_json::Value;

#[derive(Clone)]
pub struct NaabuPortScan;

impl NaabuPortScan {
    fn port_from_json(entry: &Value) -> Option<u16> {
        let port = entry.get("port")?;
        // older naabu builds nest the number in an object
        let number = port
            .as_u64()
            .or_else(|| port.get("Port").and_then(Value::as_u64))
            .or_else(|| port.as_str().and_then(|s| s.parse().ok()))?;
        u16::try_from(number).ok()
    }

    fn parse_line(line: &str, fallback_host: &str) -> Option<(String, u16)> {
        if line.starts_with('{') {
            let entry: Value = serde_json::from_str(line).ok()?;
            let host = entry
                .get("host")
                .and_then(Value::as_str)
                .filter(|h| !h.is_empty())
                .or_else(|| entry.get("ip").and_then(Value::as_str))
                .unwrap_or(fallback_host)
                .to_string();
            return Some((host, Self::port_from_json(&entry)?));
        }
        let (host, port) = line.rsplit_once(':')?;
        Some((host.to_string(), port.trim().parse().ok()?))
    }
}

impl ToolAdapter for NaabuPortScan {
    fn name(&self) -> &'static str {
        "naabu"
    }

    fn binary(&self) -> &'static str {
        "naabu"
    }

    fn phase(&self) -> Phase {
        Phase::Ports
    }

    fn cost_hint(&self) -> u32 {
        20
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let scan = &ctx.config.scan;
        let rate = if policy.safe_mode {
            scan.safe_naabu_rate
        } else {
            scan.naabu_rate
        };
        let mut spec = ctx
            .command(policy)
            .opt("-host", ctx.unit.input())
            .args(["-silent", "-json"])
            .opt("-rate", rate.to_string())
            .args(["-warm-up-time", "0", "-retries", "1"]);
        spec = match scan.port_range() {
            Some(range) if range == "1-65535" => spec.opt("-p", "-"),
            Some(range) => spec.opt("-p", range),
            None => spec.opt("-top-ports", scan.top_ports.to_string()),
        };
        if !scan.excluded_ports.is_empty() {
            let excluded: Vec<String> = scan.excluded_ports.iter().map(u16::to_string).collect();
            spec = spec.opt("-exclude-ports", excluded.join(","));
        }
        if let Some(proxy) = ctx.config.proxy_authority() {
            spec = spec.opt("-proxy", proxy);
        }
        Ok(spec)
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let excluded = &ctx.config.scan.excluded_ports;
        let unit_host = ctx.unit.input();
        parse_lines(&raw.stdout, |line| {
            let (host, port) = Self::parse_line(line, unit_host)?;
            if excluded.contains(&port) {
                return Some(Vec::new());
            }
            // naabu may report the address; keep the scanned name as the host
            let host = if host.parse::<std::net::IpAddr>().is_ok() && !unit_host.is_empty() {
                unit_host.to_string()
            } else {
                host
            };
            Some(Finding::port(&host, port, Protocol::Tcp, self.name()).into_iter().collect())
        })
    }
}
