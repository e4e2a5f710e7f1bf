//! Target selection

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// How the target process is picked. Written in YAML as a one-key map,
/// `pid: 4242` or `name: postgres`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectorFields", into = "SelectorFields")]
pub enum TargetSelector {
    Pid(u32),
    /// Substring of the command line.
    Name(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectorFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl TryFrom<SelectorFields> for TargetSelector {
    type Error = String;

    fn try_from(fields: SelectorFields) -> std::result::Result<Self, Self::Error> {
        match (fields.pid, fields.name) {
            (Some(pid), None) => Ok(TargetSelector::Pid(pid)),
            (None, Some(name)) if !name.is_empty() => Ok(TargetSelector::Name(name)),
            (None, Some(_)) => Err("target name must not be empty".into()),
            (Some(_), Some(_)) => Err("target takes either pid or name, not both".into()),
            (None, None) => Err("target needs a pid or a name".into()),
        }
    }
}

impl From<TargetSelector> for SelectorFields {
    fn from(selector: TargetSelector) -> Self {
        match selector {
            TargetSelector::Pid(pid) => SelectorFields {
                pid: Some(pid),
                name: None,
            },
            TargetSelector::Name(name) => SelectorFields {
                pid: None,
                name: Some(name),
            },
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Pid(pid) => write!(f, "pid {}", pid),
            TargetSelector::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// A resolved process. Re-created on every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: u32,
    pub command_name: String,
    /// Start time in clock ticks since boot, used to tell a recycled PID
    /// from the process we resolved.
    pub start_time: u64,
    pub discovery_time: SystemTime,
}

impl TargetProcess {
    pub fn new(pid: u32, command_name: impl Into<String>, start_time: u64) -> Self {
        Self {
            pid,
            command_name: command_name.into(),
            start_time,
            discovery_time: SystemTime::now(),
        }
    }
}

pub trait ProcessResolver: Send + Sync {
    fn resolve(&self, selector: &TargetSelector) -> Result<TargetProcess>;

    /// `false` once the process is gone, a zombie, or its PID was reused.
    fn is_alive(&self, target: &TargetProcess) -> bool;
}

/// A running process considered during name resolution.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pid: u32,
    pub command_name: String,
    pub cmdline: String,
    pub start_time: u64,
}

/// Pick the most recently started candidate whose command line contains
/// `pattern`. PIDs in `excluded` (our own process and the chain that
/// launched it, e.g. `sudo`) and other instances of us never match.
pub fn select_candidate<I>(
    candidates: I,
    pattern: &str,
    excluded: &[u32],
    own_command: Option<&str>,
) -> Option<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .filter(|c| !excluded.contains(&c.pid))
        .filter(|c| own_command != Some(c.command_name.as_str()))
        .filter(|c| c.cmdline.contains(pattern))
        .max_by_key(|c| (c.start_time, c.pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pid: u32, comm: &str, cmdline: &str, start_time: u64) -> Candidate {
        Candidate {
            pid,
            command_name: comm.into(),
            cmdline: cmdline.into(),
            start_time,
        }
    }

    #[test]
    fn test_most_recent_match_wins() {
        let picked = select_candidate(
            vec![
                candidate(100, "redis-server", "redis-server *:6379", 500),
                candidate(90, "redis-server", "redis-server *:6380", 900),
                candidate(200, "bash", "bash", 1000),
            ],
            "redis",
            &[1],
            None,
        )
        .unwrap();
        assert_eq!(picked.pid, 90);
    }

    #[test]
    fn test_equal_start_time_prefers_higher_pid() {
        let picked = select_candidate(
            vec![
                candidate(10, "worker", "worker --id 1", 42),
                candidate(11, "worker", "worker --id 2", 42),
            ],
            "worker",
            &[1],
            None,
        )
        .unwrap();
        assert_eq!(picked.pid, 11);
    }

    #[test]
    fn test_own_process_excluded() {
        let candidates = vec![
            candidate(7, "proctrace", "proctrace run -e nginx", 99),
            candidate(8, "proctrace", "proctrace run -e nginx --verbose", 98),
            candidate(3, "nginx", "nginx: master process", 10),
        ];
        let picked =
            select_candidate(candidates.clone(), "nginx", &[7], Some("proctrace")).unwrap();
        assert_eq!(picked.pid, 3);

        assert!(select_candidate(candidates, "proctrace", &[7], Some("proctrace")).is_none());
    }

    #[test]
    fn test_launcher_ancestors_excluded() {
        // `sudo proctrace run -e nginx`: the sudo parent started last and
        // its command line contains the pattern
        let candidates = vec![
            candidate(3, "nginx", "nginx: master process", 10),
            candidate(6, "sudo", "sudo proctrace run -e nginx", 98),
            candidate(7, "proctrace", "proctrace run -e nginx", 99),
        ];
        let picked = select_candidate(candidates, "nginx", &[7, 6, 1], Some("proctrace")).unwrap();
        assert_eq!(picked.pid, 3);
        assert_eq!(picked.command_name, "nginx");
    }

    #[test]
    fn test_selector_yaml() {
        let selector: TargetSelector = serde_yaml::from_str("name: postgres").unwrap();
        assert_eq!(selector, TargetSelector::Name("postgres".into()));
        let selector: TargetSelector = serde_yaml::from_str("pid: 4242").unwrap();
        assert_eq!(selector, TargetSelector::Pid(4242));
        assert_eq!(selector.to_string(), "pid 4242");

        let yaml = serde_yaml::to_string(&TargetSelector::Name("redis".into())).unwrap();
        assert_eq!(yaml.trim(), "name: redis");
    }

    #[test]
    fn test_selector_yaml_needs_exactly_one_key() {
        assert!(serde_yaml::from_str::<TargetSelector>("pid: 1\nname: redis").is_err());
        assert!(serde_yaml::from_str::<TargetSelector>("{}").is_err());
        assert!(serde_yaml::from_str::<TargetSelector>("name: ''").is_err());
        assert!(serde_yaml::from_str::<TargetSelector>("command: redis").is_err());
    }
}
