use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// One stage of the reconnaissance pipeline, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Osint,
    Subdomains,
    Ports,
    Directories,
    Crawling,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Osint,
        Phase::Subdomains,
        Phase::Ports,
        Phase::Directories,
        Phase::Crawling,
    ];

    pub fn index(self) -> u8 {
        match self {
            Phase::Osint => 0,
            Phase::Subdomains => 1,
            Phase::Ports => 2,
            Phase::Directories => 3,
            Phase::Crawling => 4,
        }
    }

    pub fn from_index(index: u8) -> Option<Phase> {
        Phase::ALL.get(index as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Osint => "osint",
            Phase::Subdomains => "subdomains",
            Phase::Ports => "ports",
            Phase::Directories => "directories",
            Phase::Crawling => "crawling",
        }
    }

    /// Directory name used for raw tool output of this phase.
    pub fn dir_name(self) -> String {
        format!("phase{}_{}", self.index(), self.label())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({})", self.index(), self.label())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(index) = s.parse::<u8>() {
            return Phase::from_index(index).ok_or_else(|| format!("unknown phase index {index}"));
        }
        Phase::ALL
            .into_iter()
            .find(|phase| phase.label() == s)
            .ok_or_else(|| format!("unknown phase '{s}'"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Domain,
    Ip,
}

/// A validated scan target. Immutable once built by the scope validator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    /// Input exactly as supplied by the user.
    pub raw: String,
    /// Canonical host (lowercase, no scheme, port or path).
    pub host: String,
    /// Registrable domain used by passive enumerators; equal to `host` for IPs.
    pub domain: String,
    pub kind: TargetKind,
    /// Explicit port from the input, if any.
    pub port: Option<u16>,
    pub resolved: Vec<IpAddr>,
}

impl Target {
    pub fn is_ip(&self) -> bool {
        self.kind == TargetKind::Ip
    }

    /// Web origin for the target: `https://host` unless an explicit non-443
    /// port was given.
    pub fn base_url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            None | Some(443) => format!("https://{host}"),
            Some(port) => format!("http://{host}:{port}"),
        }
    }

    pub fn with_resolved(mut self, mut addrs: Vec<IpAddr>) -> Self {
        addrs.sort();
        addrs.dedup();
        self.resolved = addrs;
        self
    }
}

/// Per-run directory layout.
#[derive(Clone, Debug)]
pub struct RunDirs {
    pub root: PathBuf, // <output>/<target>_<timestamp>
    pub raw: PathBuf,
    pub tmp: PathBuf,
    pub report: PathBuf,
}

impl RunDirs {
    pub fn phase_raw(&self, phase: Phase) -> PathBuf {
        self.raw.join(phase.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parses_from_index_and_name() {
        assert_eq!("2".parse::<Phase>().unwrap(), Phase::Ports);
        assert_eq!("Crawling".parse::<Phase>().unwrap(), Phase::Crawling);
        assert!("7".parse::<Phase>().is_err());
        assert!("nope".parse::<Phase>().is_err());
    }

    #[test]
    fn phases_are_ordered() {
        let mut phases = vec![Phase::Crawling, Phase::Osint, Phase::Directories];
        phases.sort();
        assert_eq!(phases, vec![Phase::Osint, Phase::Directories, Phase::Crawling]);
        assert_eq!(Phase::Directories.dir_name(), "phase3_directories");
    }
}
