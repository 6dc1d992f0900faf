use super::types::{
    CommandSpec, ParseOutcome, RawOutput, Stage, ToolAdapter, ToolContext, parse_lines,
};
use crate::core::errors::EngineError;
use crate::core::findings::{Evidence, Finding, Protocol, Sourced};
use crate::core::models::Phase;
use crate::core::policy::Policy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<port protocol="(\w+)" portid="(\d+)">(.*?)</port>"#).expect("nmap port regex")
});
static STATE_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<state state="open""#).expect("nmap state regex"));
static SERVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<service\s([^>]*?)/?>"#).expect("nmap service regex"));
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("nmap attribute regex"));
static NORMAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)/(tcp|udp)\s+open\s+(\S+)(?:\s+(.*))?$").expect("nmap normal output regex")
});

/// Service/version detection on discovered ports. With no discovered ports
/// for a host it falls back to the configured port strategy.
#[derive(Clone)]
pub struct NmapServiceScan;

struct ServiceInfo {
    name: Option<String>,
    version: Option<String>,
}

impl NmapServiceScan {
    fn protocol(raw: &str) -> Option<Protocol> {
        match raw {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }

    fn service_info(body: &str) -> ServiceInfo {
        let Some(service) = SERVICE_RE.captures(body) else {
            return ServiceInfo {
                name: None,
                version: None,
            };
        };
        let attrs: BTreeMap<&str, &str> = ATTR_RE
            .captures_iter(service.get(1).map_or("", |m| m.as_str()))
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();
        let version = [attrs.get("product"), attrs.get("version")]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        ServiceInfo {
            name: attrs.get("name").map(|n| n.to_string()).filter(|n| !n.is_empty()),
            version: Some(version).filter(|v| !v.is_empty()),
        }
    }

    fn finding(&self, host: &str, port: u16, protocol: Protocol, info: ServiceInfo) -> Option<Finding> {
        let mut finding = Finding::port(host, port, protocol, self.name())?;
        if let Finding::Port(p) = &mut finding {
            p.service = info
                .name
                .map(|name| Sourced::new(name, self.name(), Evidence::Verified));
            p.version = info
                .version
                .map(|version| Sourced::new(version, self.name(), Evidence::Verified));
        }
        Some(finding)
    }

    fn parse_xml(&self, xml: &str, host: &str) -> ParseOutcome {
        let mut findings = Vec::new();
        let mut parsed = 0;
        for caps in PORT_RE.captures_iter(xml) {
            parsed += 1;
            let body = &caps[3];
            if !STATE_OPEN_RE.is_match(body) {
                continue;
            }
            let (Some(protocol), Ok(port)) = (Self::protocol(&caps[1]), caps[2].parse::<u16>()) else {
                continue;
            };
            findings.extend(self.finding(host, port, protocol, Self::service_info(body)));
        }
        // a run document without <port> blocks means nothing was open
        let skipped = usize::from(parsed == 0 && !xml.contains("<nmaprun"));
        ParseOutcome::new(findings, parsed, skipped)
    }

    fn parse_normal(&self, text: &str, host: &str) -> ParseOutcome {
        let mut outcome = parse_lines(text, |line| {
            let caps = NORMAL_RE.captures(line)?;
            let port: u16 = caps[1].parse().ok()?;
            let protocol = Self::protocol(&caps[2])?;
            let info = ServiceInfo {
                name: Some(caps[3].to_string()),
                version: caps.get(4).map(|m| m.as_str().trim().to_string()).filter(|v| !v.is_empty()),
            };
            Some(self.finding(host, port, protocol, info).into_iter().collect())
        });
        // banners and host lines surround the port table
        outcome.degraded = outcome.parsed_lines == 0 && text.contains("/tcp");
        outcome
    }
}

impl ToolAdapter for NmapServiceScan {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn binary(&self) -> &'static str {
        "nmap"
    }

    fn phase(&self) -> Phase {
        Phase::Ports
    }

    fn stage(&self) -> Stage {
        Stage::Verify
    }

    fn cost_hint(&self) -> u32 {
        50
    }

    fn output_sink(&self) -> Option<&'static str> {
        Some("xml")
    }

    fn build_invocation(&self, ctx: &ToolContext, policy: &Policy) -> Result<CommandSpec, EngineError> {
        let host = ctx.unit.input();
        let scan = &ctx.config.scan;
        let mut spec = ctx
            .command(policy)
            .args(["-sV", "-Pn"])
            .arg(if policy.safe_mode { "-T2" } else { "-T4" });
        if scan.nmap_scripts {
            spec = spec.arg("-sC");
        }
        spec = match ctx.input.ports.get(host).filter(|ports| !ports.is_empty()) {
            Some(ports) => {
                let list: Vec<String> = ports.iter().map(u16::to_string).collect();
                spec.opt("-p", list.join(","))
            }
            None => match scan.port_range() {
                Some(range) if range == "1-65535" => spec.arg("-p-"),
                Some(range) => spec.opt("-p", range),
                None => spec.opt("--top-ports", scan.top_ports.to_string()),
            },
        };
        if !scan.excluded_ports.is_empty() {
            let excluded: Vec<String> = scan.excluded_ports.iter().map(u16::to_string).collect();
            spec = spec.opt("--exclude-ports", excluded.join(","));
        }
        let sink = ctx.output_file()?;
        Ok(spec.opt("-oX", sink).arg(host))
    }

    fn parse(&self, raw: &RawOutput, ctx: &ToolContext) -> ParseOutcome {
        let host = ctx.unit.input();
        match raw.sink.as_deref().filter(|xml| !xml.trim().is_empty()) {
            Some(xml) => self.parse_xml(xml, host),
            None => self.parse_normal(&raw.stdout, host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::PhaseInput;
    use crate::plugins::types::testing::{context, policy};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -sV -Pn -T4 -p 22,5432,8080 -oX out.xml db.example.com">
<host><status state="up"/>
<ports>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack" reason_ttl="0"/><service name="ssh" product="OpenSSH" version="8.2p1 Ubuntu 4ubuntu0.5" extrainfo="Ubuntu Linux; protocol 2.0" method="probed" conf="10"/></port>
<port protocol="tcp" portid="5432"><state state="open" reason="syn-ack" reason_ttl="0"/><service name="postgresql" product="PostgreSQL DB" version="13.4" method="probed" conf="10"><cpe>cpe:/a:postgresql:postgresql:13.4</cpe></service></port>
<port protocol="tcp" portid="8080"><state state="filtered" reason="no-response" reason_ttl="0"/><service name="http-proxy" method="table" conf="3"/></port>
</ports>
</host>
</nmaprun>"#;

    fn services(outcome: &ParseOutcome) -> Vec<(u16, Option<String>, Option<String>)> {
        outcome
            .findings
            .iter()
            .map(|f| match f {
                Finding::Port(p) => (
                    p.port,
                    p.service.as_ref().map(|s| s.value.clone()),
                    p.version.as_ref().map(|s| s.value.clone()),
                ),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn parses_xml_sink() {
        let ctx = context("example.com", &["db.example.com"]);
        let raw = RawOutput {
            stdout: String::new(),
            sink: Some(XML.to_string()),
        };
        let outcome = NmapServiceScan.parse(&raw, &ctx);
        assert!(!outcome.degraded);
        assert_eq!(
            services(&outcome),
            vec![
                (22, Some("ssh".into()), Some("OpenSSH 8.2p1 Ubuntu 4ubuntu0.5".into())),
                (5432, Some("postgresql".into()), Some("PostgreSQL DB 13.4".into())),
            ]
        );
        assert!(outcome.findings.iter().all(|f| match f {
            Finding::Port(p) => p.version.as_ref().unwrap().evidence == Evidence::Verified,
            _ => false,
        }));
    }

    #[test]
    fn empty_scan_is_not_degraded() {
        let ctx = context("example.com", &["db.example.com"]);
        let raw = RawOutput {
            stdout: String::new(),
            sink: Some("<nmaprun><host><status state=\"up\"/></host></nmaprun>".into()),
        };
        let outcome = NmapServiceScan.parse(&raw, &ctx);
        assert!(outcome.findings.is_empty());
        assert!(!outcome.degraded);
    }

    #[test]
    fn falls_back_to_normal_output() {
        let ctx = context("example.com", &["db.example.com"]);
        let stdout = "Nmap scan report for db.example.com (10.0.0.5)\nPORT     STATE SERVICE    VERSION\n22/tcp   open  ssh        OpenSSH 8.2p1\n80/tcp   open  http\n443/tcp  closed https\n";
        let outcome = NmapServiceScan.parse(&RawOutput::from_stdout(stdout), &ctx);
        assert_eq!(
            services(&outcome),
            vec![
                (22, Some("ssh".into()), Some("OpenSSH 8.2p1".into())),
                (80, Some("http".into()), None),
            ]
        );
        assert!(!outcome.degraded);
    }

    #[test]
    fn scans_discovered_ports_only() {
        let mut input = PhaseInput::new(vec!["db.example.com".into()]);
        input
            .ports
            .insert("db.example.com".into(), BTreeSet::from([5432, 22]));
        let mut ctx = context("example.com", &["db.example.com"]);
        ctx.input = Arc::new(input);

        let spec = NmapServiceScan.build_invocation(&ctx, &policy(false)).unwrap();
        assert!(spec.has_arg("22,5432"));
        assert!(spec.has_arg("-T4"));
        assert_eq!(spec.args.last().map(String::as_str), Some("db.example.com"));

        let safe = NmapServiceScan.build_invocation(&ctx, &policy(true)).unwrap();
        assert!(safe.has_arg("-T2"));
    }

    #[test]
    fn runs_alone_with_port_strategy() {
        let ctx = context("example.com", &["db.example.com"]);
        let spec = NmapServiceScan.build_invocation(&ctx, &policy(false)).unwrap();
        assert!(spec.has_arg("--top-ports"));
        assert!(spec.has_arg("-oX"));
    }
}
